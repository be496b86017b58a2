//! Runtime lifecycle and the embedding surface
//!
//! [`Embedder`] owns at most one live [`RuntimeInstance`] (engine handle,
//! execution context, event loop, module registry) and moves it through
//! `Uninitialized -> Running -> ShuttingDown -> Terminated`. A terminated
//! embedder may be initialized again.
//!
//! Guest values never escape the instance: they are only reachable inside
//! [`Embedder::with_scope`], whose closure is bound to the context lifetime.
//! Values meant to outlive a call are marshaled to [`HostValue`] first.
//!
//! An `Embedder` is single-threaded (it is `!Send`). Only the [`StopHandle`]
//! may cross threads.

use crate::bootstrap;
use crate::bridge::{self, Callee};
use crate::error::EmbedError;
use crate::event_loop::{DriveMode, EventLoop, LoopStats, StopHandle};
use crate::module::{ModuleDescriptor, ModuleInfo, ModuleRegistry, NativeCallback};
use crate::script::{self, INLINE_SCRIPT_NAME};
use crate::settings::{EngineSettings, DEFAULT_PROGRAM_NAME};
use crate::value::{guest_type_name, HostValue};
use rquickjs::{Context, Ctx, FromJs, IntoJs, Object, Runtime, Value};
use std::cell::RefCell;
use std::path::{Path, PathBuf};

/// Returned by [`Embedder::deinitialize`] when there was nothing to tear down.
pub const NOT_RUNNING_EXIT_STATUS: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Running,
    ShuttingDown,
    Terminated,
}

/// Engine state of one initialize/deinitialize cycle.
pub struct RuntimeInstance {
    event_loop: EventLoop,
    modules: RefCell<ModuleRegistry>,
    settings: EngineSettings,
    context: Context,
    runtime: Runtime,
}

impl RuntimeInstance {
    fn boot(settings: EngineSettings) -> Result<Self, EmbedError> {
        let runtime = Runtime::new().map_err(EmbedError::Engine)?;
        settings.apply(&runtime);
        let context = Context::full(&runtime).map_err(EmbedError::Engine)?;
        let event_loop = EventLoop::new();

        context.with(|ctx| {
            bootstrap::install(&ctx, &settings, &event_loop)
                .map_err(|err| EmbedError::capture(&ctx, err))
        })?;

        Ok(Self {
            event_loop,
            modules: RefCell::new(ModuleRegistry::new()),
            settings,
            context,
            runtime,
        })
    }

    pub fn engine(&self) -> &Runtime {
        &self.runtime
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

impl Drop for RuntimeInstance {
    fn drop(&mut self) {
        // Queued callbacks hold engine references and must go before the engine.
        self.event_loop.discard();
    }
}

/// The host's handle on an embedded guest runtime.
pub struct Embedder {
    state: LifecycleState,
    instance: Option<RuntimeInstance>,
}

impl Embedder {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            instance: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }

    /// Engine handle, present only while running.
    pub fn engine_handle(&self) -> Option<&Runtime> {
        self.instance.as_ref().map(RuntimeInstance::engine)
    }

    /// Execution context handle, present only while running.
    pub fn context_handle(&self) -> Option<&Context> {
        self.instance.as_ref().map(RuntimeInstance::context)
    }

    /// Starts the engine and runs the bootstrap sequence. Pending work created
    /// later is not processed until `process_events` or `run_event_loop`.
    pub fn initialize<S: AsRef<str>>(
        &mut self,
        program_name: &str,
        engine_args: &[S],
    ) -> Result<(), EmbedError> {
        if self.is_running() {
            return Err(EmbedError::AlreadyInitialized);
        }
        let settings = EngineSettings::from_args(program_name, engine_args)?;
        self.initialize_with(settings)
    }

    /// `initialize` with the default program name and no engine arguments.
    pub fn initialize_default(&mut self) -> Result<(), EmbedError> {
        self.initialize::<&str>(DEFAULT_PROGRAM_NAME, &[])
    }

    pub fn initialize_with(&mut self, settings: EngineSettings) -> Result<(), EmbedError> {
        if self.is_running() {
            return Err(EmbedError::AlreadyInitialized);
        }

        let program = settings.program_name.clone();
        self.instance = Some(RuntimeInstance::boot(settings)?);
        self.state = LifecycleState::Running;
        tracing::info!(program = %program, version = crate::VERSION, "guest runtime initialized");
        Ok(())
    }

    /// Stops accepting new work, drains what is pending, tears the engine
    /// down and returns the guest's exit code. A no-op returning
    /// [`NOT_RUNNING_EXIT_STATUS`] when not running.
    pub fn deinitialize(&mut self) -> i32 {
        if !self.is_running() {
            return NOT_RUNNING_EXIT_STATUS;
        }
        let Some(instance) = self.instance.take() else {
            self.state = LifecycleState::Terminated;
            return NOT_RUNNING_EXIT_STATUS;
        };

        self.state = LifecycleState::ShuttingDown;
        tracing::info!("guest runtime shutting down");

        instance.event_loop.drain(&instance.runtime, &instance.context);
        let code = instance.context.with(|ctx| bootstrap::exit_code(&ctx));
        drop(instance);

        self.state = LifecycleState::Terminated;
        tracing::info!(exit_code = code, "guest runtime terminated");
        code
    }

    /// The live instance, if any.
    pub fn runtime_instance(&self) -> Option<&RuntimeInstance> {
        self.instance.as_ref()
    }

    fn instance(&self) -> Result<&RuntimeInstance, EmbedError> {
        match (&self.instance, self.state) {
            (Some(instance), LifecycleState::Running) => Ok(instance),
            _ => Err(EmbedError::NotInitialized),
        }
    }

    /// Runs `f` with access to guest values of the running context.
    pub fn with_scope<R, F>(&self, f: F) -> Result<R, EmbedError>
    where
        F: for<'js> FnOnce(Scope<'js>) -> Result<R, EmbedError>,
    {
        let instance = self.instance()?;
        instance.context.with(|ctx| f(Scope { ctx }))
    }

    /// Executes the script at `path` once and marshals its completion value.
    /// Parts of the completion value with no host form read as `Undefined`;
    /// a script that ran never fails on marshaling.
    pub fn run(&self, path: impl AsRef<Path>) -> Result<HostValue, EmbedError> {
        let path = path.as_ref();
        self.with_scope(|scope| Ok(scope.to_host_lossy(scope.run(path)?)))
    }

    /// Executes inline code and marshals its completion value, as `run` does.
    pub fn evaluate(&self, code: &str) -> Result<HostValue, EmbedError> {
        self.with_scope(|scope| Ok(scope.to_host_lossy(scope.evaluate(code)?)))
    }

    /// Calls a global function with host arguments. The return value is
    /// marshaled like a completion value.
    pub fn call_global(&self, function: &str, args: &[HostValue]) -> Result<HostValue, EmbedError> {
        self.with_scope(|scope| {
            let args = args
                .iter()
                .map(|arg| scope.to_guest(arg.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            let root = scope.root_object();
            let value = scope.call(&root, function, args)?;
            Ok(scope.to_host_lossy(value))
        })
    }

    /// Reads a global property as a host value. Unlike a completion value
    /// this is strict: a function or cyclic structure is a `TypeMismatch`.
    pub fn get_global(&self, name: &str) -> Result<HostValue, EmbedError> {
        self.with_scope(|scope| {
            let root = scope.root_object();
            let value = scope.get_value(&root, name)?;
            scope.to_host(value)
        })
    }

    /// Runs at most one unit of pending guest work. Returns `false` when
    /// nothing was pending.
    pub fn process_events(&self) -> Result<bool, EmbedError> {
        let instance = self.instance()?;
        instance
            .event_loop
            .process_events(&instance.runtime, &instance.context)
    }

    /// Cedes this thread to the event loop until it drains or a stop is
    /// requested, calling `callback` after every tick.
    pub fn run_event_loop<F: FnMut()>(&self, callback: F) -> Result<(), EmbedError> {
        let instance = self.instance()?;
        instance
            .event_loop
            .run(&instance.runtime, &instance.context, callback)
    }

    /// Requests that a running `run_event_loop` return after its current
    /// tick. Harmless when no loop is running; the request does not carry
    /// over to a later `run_event_loop` call.
    pub fn stop_event_loop(&self) {
        if let Some(instance) = &self.instance {
            instance.event_loop.stop_handle().stop();
        }
    }

    /// Stop handle usable from other threads or from inside the tick callback.
    pub fn stop_handle(&self) -> Result<StopHandle, EmbedError> {
        Ok(self.instance()?.event_loop.stop_handle())
    }

    /// True only while `run_event_loop` is driving the loop.
    pub fn event_loop_is_running(&self) -> bool {
        self.instance
            .as_ref()
            .map_or(false, |instance| instance.event_loop.mode() == Some(DriveMode::GuestDriven))
    }

    pub fn has_pending_work(&self) -> bool {
        self.instance
            .as_ref()
            .map_or(false, |instance| instance.event_loop.has_pending(&instance.runtime))
    }

    pub fn loop_stats(&self) -> Option<LoopStats> {
        self.instance.as_ref().map(|instance| instance.event_loop.stats())
    }

    /// Registers a native module. Names are unique per instance; a second
    /// registration under the same name fails with `ModuleNameCollision`.
    pub fn register_module(&self, descriptor: ModuleDescriptor) -> Result<(), EmbedError> {
        let instance = self.instance()?;
        let mut modules = instance.modules.borrow_mut();
        instance
            .context
            .with(|ctx| modules.register(&ctx, descriptor))
    }

    /// Registers `functions` as module `name`, optionally exposed as global
    /// `target` (empty for none).
    pub fn register_functions<I, S>(
        &self,
        name: &str,
        functions: I,
        target: &str,
    ) -> Result<(), EmbedError>
    where
        I: IntoIterator<Item = (S, NativeCallback)>,
        S: Into<String>,
    {
        let descriptor = functions
            .into_iter()
            .fold(ModuleDescriptor::new(name), |descriptor, (function, callback)| {
                descriptor.callback(function, callback)
            })
            .expose_as(target);
        self.register_module(descriptor)
    }

    pub fn module(&self, name: &str) -> Option<ModuleInfo> {
        let instance = self.instance.as_ref()?;
        let modules = instance.modules.borrow();
        modules.get(name).cloned()
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.instance
            .as_ref()
            .map(|instance| instance.modules.borrow().iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for Embedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Embedder {
    // No drain here: dropping must not block on guest timers.
    fn drop(&mut self) {
        if self.instance.take().is_some() {
            tracing::debug!("embedder dropped while running, pending work discarded");
        }
    }
}

/// Borrowed access to a running execution context. Every guest value
/// obtained here is tied to the `'js` lifetime and cannot leave the scope.
pub struct Scope<'js> {
    ctx: Ctx<'js>,
}

impl<'js> Scope<'js> {
    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    /// The global scope of the execution context.
    pub fn root_object(&self) -> Object<'js> {
        self.ctx.globals()
    }

    pub fn evaluate(&self, code: &str) -> Result<Value<'js>, EmbedError> {
        script::execute(&self.ctx, code, INLINE_SCRIPT_NAME)
    }

    /// Runs a script file; stack traces and parse errors name `path`.
    pub fn run(&self, path: &Path) -> Result<Value<'js>, EmbedError> {
        let source = read_script(path)?;
        tracing::debug!(path = %path.display(), "running script");
        script::execute(&self.ctx, &source, &path.to_string_lossy())
    }

    /// Loads a CommonJS-style file and returns its `module.exports`.
    ///
    /// Only `path` itself is loaded. The wrapper provides `module`, `exports`,
    /// `__filename` and `__dirname` but no `require`, so the file cannot pull
    /// in dependencies of its own.
    pub fn include_module(&self, path: &Path) -> Result<Object<'js>, EmbedError> {
        let source = read_script(path)?;
        let filename = path.to_string_lossy().into_owned();
        let dirname = path
            .parent()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();

        let wrapped =
            format!("(function (exports, module, __filename, __dirname) {{\n{source}\n}})");
        let wrapper = script::execute(&self.ctx, &wrapped, &filename)?;
        let Some(wrapper) = wrapper.into_function() else {
            return Err(EmbedError::type_mismatch("function", "module wrapper"));
        };

        let load = || -> rquickjs::Result<Value<'js>> {
            let exports = Object::new(self.ctx.clone())?;
            let module = Object::new(self.ctx.clone())?;
            module.set("exports", exports.clone())?;
            wrapper.call::<_, ()>((exports, module.clone(), filename, dirname))?;
            module.get("exports")
        };
        let exports = load().map_err(|err| EmbedError::capture(&self.ctx, err))?;

        let found = guest_type_name(&exports);
        exports
            .into_object()
            .ok_or_else(|| EmbedError::type_mismatch("object", found))
    }

    /// Looks a registered module up the way guest code does.
    pub fn binding(&self, name: &str) -> Result<Object<'js>, EmbedError> {
        let process = self.object_at(&self.root_object(), "process")?;
        let bindings = self.object_at(&process, "_linkedBindings")?;
        self.object_at(&bindings, name)
    }

    pub fn get_value(&self, object: &Object<'js>, name: &str) -> Result<Value<'js>, EmbedError> {
        bridge::get_value(&self.ctx, object, name)
    }

    pub fn call(
        &self,
        object: &Object<'js>,
        function: impl Into<Callee<'js>>,
        args: Vec<Value<'js>>,
    ) -> Result<Value<'js>, EmbedError> {
        bridge::call(&self.ctx, object, function.into(), args)
    }

    pub fn to_host(&self, value: Value<'js>) -> Result<HostValue, EmbedError> {
        HostValue::from_js(&self.ctx, value).map_err(|err| EmbedError::capture(&self.ctx, err))
    }

    /// Never fails: functions, symbols and cycles become `Undefined`, and
    /// object properties holding functions are left out.
    pub fn to_host_lossy(&self, value: Value<'js>) -> HostValue {
        HostValue::from_guest_lossy(value)
    }

    pub fn to_guest(&self, value: impl Into<HostValue>) -> Result<Value<'js>, EmbedError> {
        value
            .into()
            .into_js(&self.ctx)
            .map_err(|err| EmbedError::capture(&self.ctx, err))
    }

    fn object_at(&self, object: &Object<'js>, name: &str) -> Result<Object<'js>, EmbedError> {
        let value = self.get_value(object, name)?;
        let found = guest_type_name(&value);
        value
            .into_object()
            .ok_or_else(|| EmbedError::type_mismatch("object", format!("{found} at '{name}'")))
    }
}

fn read_script(path: &Path) -> Result<String, EmbedError> {
    let mut source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(EmbedError::ScriptNotFound {
                path: PathBuf::from(path),
            })
        }
        Err(err) if path.is_dir() => {
            tracing::debug!(error = %err, "script path is a directory");
            return Err(EmbedError::ScriptNotFound {
                path: PathBuf::from(path),
            });
        }
        Err(err) => return Err(err.into()),
    };

    // Keep line numbers intact when blanking a shebang.
    if source.starts_with("#!") {
        let end = source.find('\n').unwrap_or(source.len());
        source.replace_range(..end, "");
    }
    Ok(source)
}
