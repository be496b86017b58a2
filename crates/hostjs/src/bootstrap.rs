//! Globals installed into every fresh execution context
//!
//! `console`, `process` and the timer functions. The guest-visible module
//! lookup (`process.binding`) and the uncaught-error listeners are plain
//! script so that guest code sees ordinary functions.

use crate::event_loop::{EventLoop, GuestTask, SharedQueue, StopHandle};
use crate::settings::EngineSettings;
use rquickjs::convert::Coerced;
use rquickjs::function::{Opt, Rest};
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value};
use std::time::{Duration, Instant};

/// Largest timer delay accepted, in milliseconds.
const TIMEOUT_MAX_MS: f64 = 2_147_483_647.0;

const PROCESS_SETUP: &str = r#"
(function (process, bindings) {
  'use strict';
  const listeners = Object.create(null);
  const hidden = (value) => ({ value, enumerable: false, writable: false, configurable: false });

  function binding(name) {
    name = String(name);
    if (!Object.prototype.hasOwnProperty.call(bindings, name)) {
      throw new Error('No such module: ' + name);
    }
    return bindings[name];
  }

  Object.defineProperty(process, '_linkedBindings', hidden(bindings));
  Object.defineProperty(process, 'binding', hidden(binding));
  Object.defineProperty(process, '_linkedBinding', hidden(binding));

  process.on = function on(event, listener) {
    if (typeof listener !== 'function') {
      throw new TypeError('listener must be a function');
    }
    (listeners[event] || (listeners[event] = [])).push(listener);
    return process;
  };

  process.listenerCount = function listenerCount(event) {
    return listeners[event] ? listeners[event].length : 0;
  };

  Object.defineProperty(process, '_fatalException', hidden(function (error) {
    const list = listeners.uncaughtException;
    if (!list || list.length === 0) {
      if (process.exitCode === undefined) {
        process.exitCode = 1;
      }
      return false;
    }
    for (const listener of list.slice()) {
      listener.call(process, error);
    }
    return true;
  }));
})
"#;

pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    settings: &EngineSettings,
    event_loop: &EventLoop,
) -> rquickjs::Result<()> {
    install_console(ctx)?;
    install_timers(ctx, event_loop.queue())?;
    install_process(ctx, settings, event_loop.stop_handle())?;
    Ok(())
}

fn install_console<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    console.set("log", console_fn(ctx, ConsoleLevel::Info)?)?;
    console.set("info", console_fn(ctx, ConsoleLevel::Info)?)?;
    console.set("debug", console_fn(ctx, ConsoleLevel::Debug)?)?;
    console.set("warn", console_fn(ctx, ConsoleLevel::Warn)?)?;
    console.set("error", console_fn(ctx, ConsoleLevel::Error)?)?;
    ctx.globals().set("console", console)
}

#[derive(Clone, Copy)]
enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

fn console_fn<'js>(ctx: &Ctx<'js>, level: ConsoleLevel) -> rquickjs::Result<Function<'js>> {
    Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
        let line = args
            .0
            .iter()
            .map(|arg| arg.0.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        match level {
            ConsoleLevel::Debug => tracing::debug!(target: "hostjs::console", "{line}"),
            ConsoleLevel::Info => tracing::info!(target: "hostjs::console", "{line}"),
            ConsoleLevel::Warn => tracing::warn!(target: "hostjs::console", "{line}"),
            ConsoleLevel::Error => tracing::error!(target: "hostjs::console", "{line}"),
        }
    })
}

fn install_timers<'js>(ctx: &Ctx<'js>, queue: SharedQueue) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let timeout_queue = queue.clone();
    let set_timeout = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, callback: Function<'js>, delay: Opt<Value<'js>>| {
            let delay_ms = delay
                .0
                .and_then(|value| value.as_number())
                .filter(|ms| ms.is_finite())
                .unwrap_or(0.0)
                .clamp(0.0, TIMEOUT_MAX_MS);
            let due = Instant::now() + Duration::from_secs_f64(delay_ms / 1000.0);
            schedule(&ctx, &timeout_queue, due, callback)
        },
    )?;
    globals.set("setTimeout", set_timeout)?;

    let immediate_queue = queue.clone();
    let set_immediate = Function::new(ctx.clone(), move |ctx: Ctx<'js>, callback: Function<'js>| {
        schedule(&ctx, &immediate_queue, Instant::now(), callback)
    })?;
    globals.set("setImmediate", set_immediate)?;

    let clear = Function::new(ctx.clone(), move |id: Opt<Value<'js>>| {
        if let Some(id) = id.0.and_then(|value| value.as_number()) {
            queue.borrow_mut().cancel(id as u32);
        }
    })?;
    globals.set("clearTimeout", clear.clone())?;
    globals.set("clearImmediate", clear)?;
    Ok(())
}

fn schedule<'js>(
    ctx: &Ctx<'js>,
    queue: &SharedQueue,
    due: Instant,
    callback: Function<'js>,
) -> rquickjs::Result<u32> {
    let task: GuestTask = Persistent::save(ctx, callback);
    let enqueued = queue.borrow_mut().enqueue(due, task);
    enqueued.map_err(|_| {
        Exception::throw_message(ctx, "event loop is shutting down, no new work is accepted")
    })
}

fn install_process<'js>(
    ctx: &Ctx<'js>,
    settings: &EngineSettings,
    stop: StopHandle,
) -> rquickjs::Result<()> {
    let process = Object::new(ctx.clone())?;
    process.set("title", settings.program_name.as_str())?;
    process.set("argv", vec![settings.program_name.clone()])?;
    process.set("execArgv", settings.exec_argv.clone())?;
    process.set("exitCode", Value::new_undefined(ctx.clone()))?;

    // Unlike a standalone runtime this does not abort the running script; it
    // records the code and ends a guest-driven loop at its next tick boundary.
    let exit = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, code: Opt<i32>| -> rquickjs::Result<()> {
            if let Some(code) = code.0 {
                let process: Object = ctx.globals().get("process")?;
                process.set("exitCode", code)?;
            }
            tracing::debug!(code = ?code.0, "guest requested exit");
            stop.stop();
            Ok(())
        },
    )?;
    process.set("exit", exit)?;
    ctx.globals().set("process", process.clone())?;

    let setup: Function = ctx.eval(PROCESS_SETUP)?;
    setup.call::<_, ()>((process, Object::new(ctx.clone())?))
}

/// `process.exitCode` as an integer; 0 when unset or not a number.
pub(crate) fn exit_code(ctx: &Ctx<'_>) -> i32 {
    let read = || -> rquickjs::Result<Option<f64>> {
        let process: Object = ctx.globals().get("process")?;
        let code: Value = process.get("exitCode")?;
        Ok(code.as_number())
    };
    match read() {
        Ok(Some(code)) => code as i32,
        Ok(None) => 0,
        Err(err) => {
            tracing::warn!(error = %err, "could not read process.exitCode");
            0
        }
    }
}
