//! # Gateway Runtime
//!
//! Process-level wiring for the RPC gateway binary.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (defaults → JSON file → environment)
//! 2. Initialise logging (`RUST_LOG`, else the configured level)
//! 3. Connect to the message bus and open the first channel
//! 4. Serve the HTTP front end
//! 5. Run until Ctrl-C or a fatal bus fault
//!
//! ## Exit Codes
//!
//! | Code | Meaning                                             |
//! |------|-----------------------------------------------------|
//! | 123  | interrupted and disconnected, or fatal fault        |
//! | 124  | interrupted but the bus connection failed to close  |

pub mod config;
pub mod logging;

pub use config::{load_config, load_config_with};
pub use logging::init_logging;

/// Exit code after an interrupt or a fatal fault.
pub const EXIT_SHUTDOWN: u8 = 123;

/// Exit code when closing the bus connection failed during shutdown.
pub const EXIT_DISCONNECT_FAILED: u8 = 124;
