//! Compiling and executing guest source text
//!
//! Compilation and execution are two separate engine calls, so a syntax
//! error in the submitted text (`Parse`) is never confused with a
//! `SyntaxError` thrown while valid code runs (`JSON.parse`, `eval`,
//! `new Function` or an explicit throw), which is a `RuntimeException`.

use crate::error::{EmbedError, GuestException};
use rquickjs::{qjs, Ctx, Value};
use std::ffi::CString;

/// Name reported in stack traces for code passed to `evaluate`.
pub(crate) const INLINE_SCRIPT_NAME: &str = "<inline>";

const COMPILE_FLAGS: u32 =
    qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_STRICT | qjs::JS_EVAL_FLAG_COMPILE_ONLY;

/// Compiles `source` as a global script named `file_name`, then runs it and
/// returns its completion value.
pub(crate) fn execute<'js>(
    ctx: &Ctx<'js>,
    source: &str,
    file_name: &str,
) -> Result<Value<'js>, EmbedError> {
    let source = CString::new(source).map_err(|err| EmbedError::Engine(err.into()))?;
    let file_name = CString::new(file_name).map_err(|err| EmbedError::Engine(err.into()))?;
    let raw = ctx.as_raw().as_ptr();

    // SAFETY: `raw` is the context behind `ctx`, alive for `'js`. Both strings
    // are NUL-terminated and outlive the call.
    let compiled = unsafe {
        qjs::JS_Eval(
            raw,
            source.as_ptr(),
            source.as_bytes().len() as _,
            file_name.as_ptr(),
            COMPILE_FLAGS as _,
        )
    };
    if unsafe { qjs::JS_IsException(compiled) } {
        return Err(GuestException::capture(ctx.catch()).into_parse_error());
    }

    // SAFETY: `JS_EvalFunction` takes ownership of the compiled script.
    let completion = unsafe { qjs::JS_EvalFunction(raw, compiled) };
    if unsafe { qjs::JS_IsException(completion) } {
        let thrown = GuestException::capture(ctx.catch());
        return Err(EmbedError::RuntimeException(thrown));
    }

    // SAFETY: the completion value is owned and belongs to this context.
    Ok(unsafe { Value::from_raw(ctx.clone(), completion) })
}
