//! Core of the Remora remote object dispatcher.
//!
//! The [`Dispatcher`] discovers objects through a [`Transport`], binds each to
//! a [`Proxy`], drives per-proxy periodic timers and delivers lifecycle, tick
//! and attribute-update callbacks to the application on one serialized
//! stream.
//!
//! [`Transport`]: remora_wire::Transport

pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod proxy;
pub mod registry;
pub mod timer;

pub use dispatcher::Dispatcher;
pub use handlers::HandlerToken;
pub use proxy::Proxy;
pub use registry::TimerState;
