//! Lua 5.4 guest.
//!
//! Installs the guest-facing globals and keeps every guest closure in a
//! [`ClosureTable`] of registry keys. Nothing here ever calls a closure from
//! a timer task or network task: those only queue ids, and the dispatcher
//! calls back into [`LuaInterpreter::invoke`] on the interpreter thread.
//!
//! # Globals
//!
//! ```lua
//! local id = setTimeout(function() print("later") end, 100)
//! clearTimeout(id)
//!
//! local tick = setInterval(function() print("tick") end, 1000)
//! clearInterval(tick)
//!
//! tcp_connect("127.0.0.1", 8080, function(ok, conn)
//!     if not ok then return print("connect failed: " .. conn) end
//!     tcp_write(conn, "ping", function(ok, n) end)
//!     tcp_read(conn, nil, function(ok, data)
//!         -- data is nil when nothing has arrived yet
//!     end)
//! end)
//!
//! http_request({ url = "https://example.com" }, function(ok, res)
//!     print(res.status, #res.body)
//! end)
//! ```
//!
//! Completion closures always receive `(ok, value_or_error)` and run once.

use crate::bridge::ExecutionRequest;
use crate::callback::{CallbackData, CallbackResult, CallbackTarget, ClosureTable, PendingCallback};
use crate::error::{GuestError, RuntimeError, RuntimeResult};
use crate::guest::{GuestInterpreter, GuestServices, Invocation};
use crate::net::HttpRequest;
use crate::timers::TimerId;
use mlua::prelude::*;
use mlua::SerializeOptions;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, trace};

type SharedClosures = Rc<RefCell<ClosureTable<LuaRegistryKey>>>;

/// Embedded Lua state plus the closures it has handed to the host.
pub struct LuaInterpreter {
    lua: Lua,
    closures: SharedClosures,
}

impl LuaInterpreter {
    /// Create a Lua state with the timer and network globals installed.
    pub fn new(services: &GuestServices) -> RuntimeResult<Self> {
        let interpreter = Self {
            lua: Lua::new(),
            closures: Rc::new(RefCell::new(ClosureTable::new())),
        };
        interpreter.register_timers(services)?;
        interpreter.register_network(services)?;
        debug!("Lua guest initialized");
        Ok(interpreter)
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Closures currently held for pending timers and completions
    pub fn registered_closures(&self) -> usize {
        self.closures.borrow().len()
    }

    fn register_timers(&self, services: &GuestServices) -> LuaResult<()> {
        let globals = self.lua.globals();

        for (name, repeating) in [("setTimeout", false), ("setInterval", true)] {
            let timers = services.timers.clone();
            let closures = self.closures.clone();
            let schedule = self.lua.create_function(
                move |lua, (callback, delay): (LuaFunction, Option<f64>)| {
                    let delay_ms = delay.unwrap_or(0.0);
                    // Checked before the cast, which would truncate -0.5 to 0
                    if delay_ms.is_nan() || delay_ms < 0.0 {
                        return Err(LuaError::external(RuntimeError::InvalidDelay(
                            delay_ms.floor() as i64,
                        )));
                    }
                    let id = timers
                        .create_timer(delay_ms as i64, repeating)
                        .map_err(LuaError::external)?;
                    // Registered before control returns to the dispatcher, so
                    // the firing can never arrive first.
                    let key = lua.create_registry_value(callback)?;
                    closures.borrow_mut().insert_timer(id, key, repeating);
                    Ok(id.0)
                },
            )?;
            globals.set(name, schedule)?;
        }

        for name in ["clearTimeout", "clearInterval"] {
            let timers = services.timers.clone();
            let closures = self.closures.clone();
            let clear = self.lua.create_function(move |lua, id: Option<u64>| {
                let Some(id) = id.map(TimerId) else {
                    return Ok(false);
                };
                let cancelled = timers.cancel_timer(id);
                let released = closures.borrow_mut().release(CallbackTarget::Timer(id));
                let had_closure = released.is_some();
                if let Some(key) = released {
                    lua.remove_registry_value(key)?;
                }
                Ok(cancelled || had_closure)
            })?;
            globals.set(name, clear)?;
        }

        Ok(())
    }

    fn register_network(&self, services: &GuestServices) -> LuaResult<()> {
        let globals = self.lua.globals();

        let net = services.network.clone();
        let closures = self.closures.clone();
        globals.set(
            "tcp_connect",
            self.lua.create_function(
                move |lua, (host, port, callback): (String, u16, LuaFunction)| {
                    let completion = register_completion(lua, &closures, callback)?;
                    net.tcp_connect(host, port, completion);
                    Ok(())
                },
            )?,
        )?;

        let net = services.network.clone();
        let closures = self.closures.clone();
        globals.set(
            "tcp_listen",
            self.lua.create_function(
                move |lua, (host, port, callback): (String, u16, LuaFunction)| {
                    let completion = register_completion(lua, &closures, callback)?;
                    net.tcp_listen(host, port, completion);
                    Ok(())
                },
            )?,
        )?;

        let net = services.network.clone();
        let closures = self.closures.clone();
        globals.set(
            "tcp_accept",
            self.lua.create_function(
                move |lua, (listener, callback): (u64, LuaFunction)| {
                    let completion = register_completion(lua, &closures, callback)?;
                    net.tcp_accept(listener, completion);
                    Ok(())
                },
            )?,
        )?;

        let net = services.network.clone();
        let closures = self.closures.clone();
        globals.set(
            "tcp_read",
            self.lua.create_function(
                move |lua, (conn, max_bytes, callback): (u64, Option<usize>, LuaFunction)| {
                    let completion = register_completion(lua, &closures, callback)?;
                    net.tcp_read(conn, max_bytes, completion);
                    Ok(())
                },
            )?,
        )?;

        let net = services.network.clone();
        let closures = self.closures.clone();
        globals.set(
            "tcp_write",
            self.lua.create_function(
                move |lua, (conn, data, callback): (u64, LuaString, LuaFunction)| {
                    let completion = register_completion(lua, &closures, callback)?;
                    net.tcp_write(conn, data.as_bytes().to_vec(), completion);
                    Ok(())
                },
            )?,
        )?;

        let net = services.network.clone();
        globals.set(
            "tcp_close",
            self.lua
                .create_function(move |_, conn: u64| Ok(net.tcp_close(conn)))?,
        )?;

        let net = services.network.clone();
        globals.set(
            "tcp_close_listener",
            self.lua
                .create_function(move |_, listener: u64| Ok(net.tcp_close_listener(listener)))?,
        )?;

        let net = services.network.clone();
        let closures = self.closures.clone();
        globals.set(
            "udp_bind",
            self.lua.create_function(
                move |lua, (host, port, callback): (String, u16, LuaFunction)| {
                    let completion = register_completion(lua, &closures, callback)?;
                    net.udp_bind(host, port, completion);
                    Ok(())
                },
            )?,
        )?;

        let net = services.network.clone();
        let closures = self.closures.clone();
        globals.set(
            "udp_send",
            self.lua.create_function(
                move |lua,
                      (socket, host, port, data, callback): (
                    u64,
                    String,
                    u16,
                    LuaString,
                    LuaFunction,
                )| {
                    let completion = register_completion(lua, &closures, callback)?;
                    net.udp_send(socket, host, port, data.as_bytes().to_vec(), completion);
                    Ok(())
                },
            )?,
        )?;

        let net = services.network.clone();
        let closures = self.closures.clone();
        globals.set(
            "udp_recv",
            self.lua.create_function(
                move |lua, (socket, max_bytes, callback): (u64, Option<usize>, LuaFunction)| {
                    let completion = register_completion(lua, &closures, callback)?;
                    net.udp_recv(socket, max_bytes, completion);
                    Ok(())
                },
            )?,
        )?;

        let net = services.network.clone();
        globals.set(
            "udp_close",
            self.lua
                .create_function(move |_, socket: u64| Ok(net.udp_close(socket)))?,
        )?;

        let net = services.network.clone();
        let closures = self.closures.clone();
        globals.set(
            "http_request",
            self.lua.create_function(
                move |lua, (options, callback): (LuaValue, LuaFunction)| {
                    let request: HttpRequest = lua.from_value(options)?;
                    if request.url.is_empty() {
                        return Err(LuaError::runtime("http_request: url is required"));
                    }
                    let completion = register_completion(lua, &closures, callback)?;
                    net.http_request(request, completion);
                    Ok(())
                },
            )?,
        )?;

        Ok(())
    }

    /// Arguments for a completion closure: `(ok, value_or_error)`.
    fn completion_args(&self, result: CallbackResult) -> LuaResult<(bool, LuaValue)> {
        match result {
            CallbackResult::Success(CallbackData::None) | CallbackResult::NoData => {
                Ok((true, LuaValue::Nil))
            }
            CallbackResult::Success(CallbackData::Bytes(bytes)) => {
                Ok((true, LuaValue::String(self.lua.create_string(&bytes)?)))
            }
            CallbackResult::Success(CallbackData::Json(value)) => {
                let options = SerializeOptions::new()
                    .serialize_none_to_null(false)
                    .serialize_unit_to_null(false);
                Ok((true, self.lua.to_value_with(&value, options)?))
            }
            CallbackResult::Failure(message) => {
                Ok((false, LuaValue::String(self.lua.create_string(&message)?)))
            }
        }
    }

    /// Convert a chunk's result to JSON. Values with no JSON form (functions,
    /// userdata) fall back to their `tostring` rendering.
    fn to_json(&self, value: LuaValue) -> serde_json::Value {
        match self.lua.from_value::<serde_json::Value>(value.clone()) {
            Ok(json) => json,
            Err(_) => self
                .lua
                .globals()
                .get::<LuaFunction>("tostring")
                .and_then(|tostring| tostring.call::<String>(value))
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

fn register_completion(
    lua: &Lua,
    closures: &SharedClosures,
    callback: LuaFunction,
) -> LuaResult<u64> {
    let key = lua.create_registry_value(callback)?;
    Ok(closures.borrow_mut().insert_completion(key))
}

impl GuestInterpreter for LuaInterpreter {
    fn execute(&mut self, request: &ExecutionRequest) -> Result<serde_json::Value, GuestError> {
        let value: LuaValue = self
            .lua
            .load(request.source.as_str())
            .set_name(request.chunk_name.as_str())
            .eval()?;
        Ok(self.to_json(value))
    }

    fn invoke(&mut self, callback: PendingCallback) -> Result<Invocation, GuestError> {
        let lua = &self.lua;
        // The table borrow ends here: the closure may call setTimeout or
        // clearTimeout, which borrow it again.
        let function = self.closures.borrow_mut().resolve(
            callback.target,
            |key| lua.registry_value::<LuaFunction>(key),
            |key| {
                let function = lua.registry_value::<LuaFunction>(&key);
                lua.remove_registry_value(key).and(function)
            },
        );

        let Some(function) = function else {
            return Ok(Invocation::Skipped);
        };
        let function = function?;

        match callback.result {
            None => function.call::<()>(())?,
            Some(result) => {
                let args = self.completion_args(result)?;
                function.call::<()>(args)?;
            }
        }

        trace!(target = ?callback.target, "Callback invoked");
        Ok(Invocation::Invoked)
    }

    fn release_all(&mut self) {
        let keys = self.closures.borrow_mut().drain();
        let released = keys.len();
        for key in keys {
            let _ = self.lua.remove_registry_value(key);
        }
        self.lua.expire_registry_values();
        if released > 0 {
            debug!(released, "Released guest closures");
        }
    }
}
