//! Calling guest functions and reading guest properties from the host

use crate::error::EmbedError;
use crate::value::guest_type_name;
use rquickjs::function::Args;
use rquickjs::{Ctx, Function, Object, Value};

/// What to invoke on a receiver: a property looked up by name, or a
/// function handle the host already holds.
pub enum Callee<'js> {
    Name(String),
    Function(Function<'js>),
}

impl<'js> From<&str> for Callee<'js> {
    fn from(name: &str) -> Self {
        Callee::Name(name.to_string())
    }
}

impl<'js> From<String> for Callee<'js> {
    fn from(name: String) -> Self {
        Callee::Name(name)
    }
}

impl<'js> From<Function<'js>> for Callee<'js> {
    fn from(function: Function<'js>) -> Self {
        Callee::Function(function)
    }
}

/// Reads `name` off `object`. An absent property is `NotFound`; a property
/// holding `undefined` or `null` is a valid result.
pub fn get_value<'js>(
    ctx: &Ctx<'js>,
    object: &Object<'js>,
    name: &str,
) -> Result<Value<'js>, EmbedError> {
    let present = object
        .contains_key(name)
        .map_err(|err| EmbedError::capture(ctx, err))?;
    if !present {
        return Err(EmbedError::NotFound {
            name: name.to_string(),
        });
    }
    object
        .get::<_, Value>(name)
        .map_err(|err| EmbedError::capture(ctx, err))
}

/// Invokes `callee` with `receiver` as `this`. Guest throws come back as
/// `RuntimeException`.
pub fn call<'js>(
    ctx: &Ctx<'js>,
    receiver: &Object<'js>,
    callee: Callee<'js>,
    args: Vec<Value<'js>>,
) -> Result<Value<'js>, EmbedError> {
    let function = match callee {
        Callee::Function(function) => function,
        Callee::Name(name) => {
            let value = get_value(ctx, receiver, &name)?;
            let found = guest_type_name(&value);
            value.into_function().ok_or_else(|| {
                EmbedError::type_mismatch("function", format!("{found} at '{name}'"))
            })?
        }
    };

    let mut call_args = Args::new(ctx.clone(), args.len());
    call_args
        .this(receiver.clone())
        .map_err(|err| EmbedError::capture(ctx, err))?;
    for arg in args {
        call_args
            .push_arg(arg)
            .map_err(|err| EmbedError::capture(ctx, err))?;
    }

    function
        .call_arg::<Value>(call_args)
        .map_err(|err| EmbedError::capture(ctx, err))
}
