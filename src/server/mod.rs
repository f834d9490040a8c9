// Server module entry
// Drainable listener, serving engine and graceful restart controller

pub mod connection;
pub mod controller;
pub mod handle;
pub mod listener;
pub mod restart;
pub mod signal;

// `loop` is a keyword, so the module is named server_loop
#[path = "loop.rs"]
pub mod server_loop;

pub use connection::DrainableConnection;
pub use controller::ServiceController;
pub use handle::{ListenerHandle, TcpHandle};
pub use listener::{create_reusable_listener, DrainableListener};
pub use server_loop::{Handler, HttpServer, ServerLoopConfig};
pub use signal::{ControlSignal, ControllerState, SignalSource};
