//! hostjs: embed a JavaScript runtime in a host application
//!
//! Start a guest runtime, feed it scripts, pass values and calls across the
//! host/guest boundary, and decide who drives the guest's pending work.
//!
//! ## Architecture
//!
//! - **Lifecycle:** [`Embedder`] owns the engine (QuickJS via `rquickjs`) and
//!   its execution context; `initialize` / `deinitialize` bracket one
//!   [`RuntimeInstance`].
//! - **Event loop:** host-stepped ([`Embedder::process_events`]) or
//!   guest-driven with a per-tick callback ([`Embedder::run_event_loop`]),
//!   cancellable through [`Embedder::stop_event_loop`] / [`StopHandle`].
//! - **Modules:** native callbacks grouped into modules that guest code
//!   reaches through `process.binding(name)` or an injected global.
//! - **Values:** [`HostValue`] for owned data, [`Scope`] for borrowed guest
//!   values, objects and functions.
//!
//! ```ignore
//! use hostjs::{Embedder, HostValue, ModuleDescriptor};
//!
//! let mut embedder = Embedder::new();
//! embedder.initialize_default()?;
//! embedder.register_module(
//!     ModuleDescriptor::new("math")
//!         .function("square", |call| Ok(HostValue::from(call.f64_arg(0)?.powi(2))))
//!         .expose_as("m"),
//! )?;
//! assert_eq!(embedder.evaluate("m.square(4)")?.as_i64(), Some(16));
//! embedder.run_event_loop(|| {})?;
//! let exit_code = embedder.deinitialize();
//! ```
//!
//! All calls must come from the thread that created the embedder. Native
//! callbacks run inside guest execution and must not call back into the
//! embedder that is running them.

mod bootstrap;
pub mod bridge;
pub mod error;
pub mod event_loop;
pub mod module;
pub mod runtime;
mod script;
pub mod settings;
pub mod value;

pub use bridge::Callee;
pub use error::{EmbedError, GuestException, SourceLocation};
pub use event_loop::{DriveMode, LoopStats, StopHandle};
pub use module::{
    native, ModuleDescriptor, ModuleInfo, NativeCall, NativeCallback, NativeError, PrivateData,
};
pub use runtime::{Embedder, LifecycleState, RuntimeInstance, Scope, NOT_RUNNING_EXIT_STATUS};
pub use settings::{EngineSettings, DEFAULT_PROGRAM_NAME};
pub use value::HostValue;

pub use rquickjs;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn scenario_evaluate_addition() {
        let mut embedder = Embedder::new();
        embedder.initialize_default().unwrap();
        assert_eq!(embedder.evaluate("1+1").unwrap(), HostValue::Int(2));
    }

    #[test]
    fn scenario_run_missing_script() {
        let mut embedder = Embedder::new();
        embedder.initialize_default().unwrap();
        assert!(matches!(
            embedder.run("missing.script"),
            Err(EmbedError::ScriptNotFound { .. })
        ));
    }

    #[test]
    fn scenario_square_through_target() {
        let mut embedder = Embedder::new();
        embedder.initialize_default().unwrap();
        embedder
            .register_functions(
                "math",
                [(
                    "square",
                    native(|call| {
                        let n = call.i64_arg(0)?;
                        Ok(HostValue::Int(n * n))
                    }),
                )],
                "m",
            )
            .unwrap();
        assert_eq!(embedder.evaluate("m.square(4)").unwrap(), HostValue::Int(16));
    }
}
