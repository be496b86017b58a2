//! Host-native modules exposed to guest code
//!
//! A module is a named table of native callbacks. Guest code reaches it
//! through `process.binding(name)`; when registered with a target it is also
//! injected into the global scope under that target name.

use crate::error::EmbedError;
use crate::value::HostValue;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Exception, FromJs, Function, IntoJs, Object, Value};
use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

/// Host function callable from guest code.
pub type NativeCallback = Rc<dyn Fn(&NativeCall<'_>) -> Result<HostValue, NativeError>>;

/// Opaque state shared by every callback of one module.
pub type PrivateData = Rc<dyn Any>;

/// Populates a module's `exports` object directly.
pub type ModuleInitializer =
    Rc<dyn for<'js> Fn(&Ctx<'js>, &Object<'js>, Option<&dyn Any>) -> rquickjs::Result<()>>;

/// Wrap a closure as a [`NativeCallback`].
pub fn native<F>(callback: F) -> NativeCallback
where
    F: Fn(&NativeCall<'_>) -> Result<HostValue, NativeError> + 'static,
{
    Rc::new(callback)
}

/// Failure reported by a native callback; rethrown into the guest.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NativeError {
    /// Thrown as a guest `TypeError`.
    #[error("{0}")]
    TypeMismatch(String),

    /// Thrown as a guest `Error`.
    #[error("{0}")]
    Failed(String),
}

static UNDEFINED: HostValue = HostValue::Undefined;

/// Arguments and context of one guest-to-host call.
pub struct NativeCall<'a> {
    module: &'a str,
    function: &'a str,
    args: &'a [HostValue],
    data: Option<&'a dyn Any>,
}

impl<'a> NativeCall<'a> {
    pub fn module(&self) -> &str {
        self.module
    }

    pub fn function(&self) -> &str {
        self.function
    }

    pub fn args(&self) -> &[HostValue] {
        self.args
    }

    /// Missing arguments read as `undefined`, as they do in the guest.
    pub fn arg(&self, index: usize) -> &HostValue {
        self.args.get(index).unwrap_or(&UNDEFINED)
    }

    /// The module's private data, if it was registered with a `T`.
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data?.downcast_ref::<T>()
    }

    pub fn i64_arg(&self, index: usize) -> Result<i64, NativeError> {
        let arg = self.arg(index);
        arg.as_i64().ok_or_else(|| self.mismatch(index, "integer", arg))
    }

    pub fn f64_arg(&self, index: usize) -> Result<f64, NativeError> {
        let arg = self.arg(index);
        arg.as_f64().ok_or_else(|| self.mismatch(index, "number", arg))
    }

    pub fn bool_arg(&self, index: usize) -> Result<bool, NativeError> {
        let arg = self.arg(index);
        arg.as_bool().ok_or_else(|| self.mismatch(index, "boolean", arg))
    }

    pub fn str_arg(&self, index: usize) -> Result<&str, NativeError> {
        let arg = self.arg(index);
        arg.as_str().ok_or_else(|| self.mismatch(index, "string", arg))
    }

    fn mismatch(&self, index: usize, expected: &str, found: &HostValue) -> NativeError {
        NativeError::TypeMismatch(format!(
            "{}.{}: argument {index} must be a {expected}, got {}",
            self.module,
            self.function,
            found.type_name()
        ))
    }
}

/// Everything needed to register one module.
pub struct ModuleDescriptor {
    name: String,
    functions: Vec<(String, NativeCallback)>,
    initializer: Option<ModuleInitializer>,
    data: Option<PrivateData>,
    target: Option<String>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            initializer: None,
            data: None,
            target: None,
        }
    }

    /// Add an exported function. Reusing a name replaces the earlier entry
    /// in place, keeping export order stable.
    pub fn function<F>(self, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&NativeCall<'_>) -> Result<HostValue, NativeError> + 'static,
    {
        self.callback(name, native(callback))
    }

    pub fn callback(mut self, name: impl Into<String>, callback: NativeCallback) -> Self {
        let name = name.into();
        match self.functions.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = callback,
            None => self.functions.push((name, callback)),
        }
        self
    }

    /// Run `initializer` against the exports object after the function table
    /// has been installed.
    pub fn initializer<F>(mut self, initializer: F) -> Self
    where
        F: for<'js> Fn(&Ctx<'js>, &Object<'js>, Option<&dyn Any>) -> rquickjs::Result<()> + 'static,
    {
        self.initializer = Some(Rc::new(initializer));
        self
    }

    pub fn private_data<T: Any>(self, data: T) -> Self {
        self.shared_data(Rc::new(data))
    }

    pub fn shared_data(mut self, data: PrivateData) -> Self {
        self.data = Some(data);
        self
    }

    /// Also expose the module as a global named `target`. Empty means no.
    pub fn expose_as(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        self.target = (!target.is_empty()).then_some(target);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|(name, _)| name.as_str())
    }
}

/// Registration record kept by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub target: Option<String>,
    pub functions: Vec<String>,
}

/// Tracks the modules of one runtime instance. Names are unique; a second
/// registration under a taken name is rejected and the first stays in force.
pub(crate) struct ModuleRegistry {
    modules: Vec<ModuleInfo>,
    name_lookup: HashMap<String, usize>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            name_lookup: HashMap::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_lookup.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleInfo> {
        self.name_lookup.get(name).map(|&index| &self.modules[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }

    pub fn register<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        descriptor: ModuleDescriptor,
    ) -> Result<(), EmbedError> {
        if self.contains(&descriptor.name) {
            return Err(EmbedError::ModuleNameCollision {
                name: descriptor.name,
            });
        }

        let exports = build_exports(ctx, &descriptor).map_err(|err| EmbedError::capture(ctx, err))?;
        publish(ctx, &descriptor, exports).map_err(|err| EmbedError::capture(ctx, err))?;

        tracing::debug!(
            module = %descriptor.name,
            target = ?descriptor.target,
            functions = descriptor.functions.len(),
            "registered native module"
        );

        let info = ModuleInfo {
            functions: descriptor.function_names().map(str::to_string).collect(),
            name: descriptor.name,
            target: descriptor.target,
        };
        self.name_lookup.insert(info.name.clone(), self.modules.len());
        self.modules.push(info);
        Ok(())
    }
}

fn build_exports<'js>(
    ctx: &Ctx<'js>,
    descriptor: &ModuleDescriptor,
) -> rquickjs::Result<Object<'js>> {
    let exports = Object::new(ctx.clone())?;
    let module: Rc<str> = Rc::from(descriptor.name.as_str());

    for (name, callback) in &descriptor.functions {
        let function = native_function(
            ctx,
            module.clone(),
            Rc::from(name.as_str()),
            callback.clone(),
            descriptor.data.clone(),
        )?;
        exports.set(name.as_str(), function)?;
    }

    if let Some(initializer) = &descriptor.initializer {
        initializer(ctx, &exports, descriptor.data.as_deref())?;
    }

    Ok(exports)
}

/// Makes `exports` reachable through `process.binding` and, if requested,
/// as a global.
fn publish<'js>(
    ctx: &Ctx<'js>,
    descriptor: &ModuleDescriptor,
    exports: Object<'js>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    let process: Object = globals.get("process")?;
    let bindings: Object = process.get("_linkedBindings")?;
    bindings.set(descriptor.name.as_str(), exports.clone())?;

    if let Some(target) = &descriptor.target {
        if globals.contains_key(target.as_str())? {
            tracing::warn!(
                module = %descriptor.name,
                target = %target,
                "module target shadows an existing global"
            );
        }
        globals.set(target.as_str(), exports)?;
    }
    Ok(())
}

fn native_function<'js>(
    ctx: &Ctx<'js>,
    module: Rc<str>,
    function: Rc<str>,
    callback: NativeCallback,
    data: Option<PrivateData>,
) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let mut host_args = Vec::with_capacity(args.0.len());
            for (index, arg) in args.0.into_iter().enumerate() {
                match HostValue::from_js(&ctx, arg) {
                    Ok(value) => host_args.push(value),
                    Err(rquickjs::Error::Exception) => return Err(rquickjs::Error::Exception),
                    Err(err) => {
                        let message = format!("{module}.{function}: argument {index}: {err}");
                        return Err(Exception::throw_type(&ctx, &message));
                    }
                }
            }

            let call = NativeCall {
                module: &module,
                function: &function,
                args: &host_args,
                data: data.as_deref(),
            };
            match callback(&call) {
                Ok(value) => value.into_js(&ctx),
                Err(NativeError::TypeMismatch(message)) => {
                    Err(Exception::throw_type(&ctx, &message))
                }
                Err(NativeError::Failed(message)) => {
                    Err(Exception::throw_message(&ctx, &message))
                }
            }
        },
    )
}
