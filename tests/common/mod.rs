//! In-process companion double.
//!
//! [`MockLauncher`] satisfies the supervisor's launcher seam by spawning a
//! thread that connects back to the listener and speaks the companion
//! protocol: pid handshake, then a command loop over a tiny variable store.
//! Pushed frames are stored verbatim and echoed back on `get_frame`, which
//! exercises the host's codec in both directions.
//!
//! Script "execution" understands just enough for the tests:
//! - `name = 'text'` sets a string variable
//! - `name = 100` sets a numeric variable (classified `unknown`, as the
//!   real companion classifies anything that is not a frame/figure/str)
//! - `name = other` copies an existing variable
//! - `name = figure` sets a figure variable (PNG magic bytes)
//! - `print('text')` appends to stdout
//! - a `fail` line produces a traceback on stderr
//! - a `warn` line produces warning-marker stderr lines

use std::collections::HashMap;
use std::net::TcpStream;
use std::process::Child;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value as Json};

use pybridge::codec::{read_frame, write_frame};
use pybridge::supervisor::{LaunchConfig, Launcher};
use pybridge::Result;

pub const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// How the mock misbehaves, for the protocol-violation tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Faithful companion.
    Normal,
    /// Echoes back a mangled variable/frame name.
    WrongEcho,
    /// Answers every command with an error ack.
    ErrorAck,
}

pub struct MockLauncher {
    behavior: Behavior,
}

impl MockLauncher {
    pub fn new(behavior: Behavior) -> MockLauncher {
        MockLauncher { behavior }
    }
}

impl Launcher for MockLauncher {
    fn launch(&mut self, _config: &LaunchConfig, port: u16, _debug: bool) -> Result<Option<Child>> {
        let behavior = self.behavior;
        std::thread::spawn(move || {
            let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            serve(stream, behavior);
        });
        // Externally managed: no child handle to supervise.
        Ok(None)
    }
}

/// A launcher that never connects, for the accept-timeout test.
pub struct NoopLauncher;

impl Launcher for NoopLauncher {
    fn launch(
        &mut self,
        _config: &LaunchConfig,
        _port: u16,
        _debug: bool,
    ) -> Result<Option<Child>> {
        Ok(None)
    }
}

/// A launcher whose companion completes the handshake and then goes silent:
/// it keeps the connection open and reads commands but never answers them.
pub struct WedgedLauncher;

impl Launcher for WedgedLauncher {
    fn launch(&mut self, _config: &LaunchConfig, port: u16, _debug: bool) -> Result<Option<Child>> {
        std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            send(
                &mut stream,
                &json!({"response": "pid_response", "pid": u32::MAX}),
            );
            while read_frame(&mut stream).is_ok() {}
        });
        Ok(None)
    }
}

/// A launcher that connects but opens with the wrong ack, for the
/// handshake test.
pub struct BadHandshakeLauncher;

impl Launcher for BadHandshakeLauncher {
    fn launch(&mut self, _config: &LaunchConfig, port: u16, _debug: bool) -> Result<Option<Child>> {
        std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            send(&mut stream, &json!({"response": "ok"}));
        });
        Ok(None)
    }
}

enum Var {
    Frame {
        fields: Json,
        body: String,
        num_rows: usize,
    },
    Str(String),
    Num(String),
    Figure(Vec<u8>),
}

fn send(stream: &mut TcpStream, ack: &Json) {
    write_frame(stream, &serde_json::to_vec(ack).unwrap()).unwrap();
}

fn serve(mut stream: TcpStream, behavior: Behavior) {
    send(
        &mut stream,
        &json!({"response": "pid_response", "pid": u32::MAX}),
    );

    let mut vars: HashMap<String, Var> = HashMap::new();
    let mut std_out = String::new();
    let mut std_err = String::new();

    loop {
        let cmd: Json = match read_frame(&mut stream) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap(),
            // Host dropped the stream.
            Err(_) => return,
        };
        let name = cmd["command"].as_str().unwrap().to_string();
        if name == "shutdown" {
            return;
        }
        if behavior == Behavior::ErrorAck {
            // accept_rows still has to drain its body frame.
            if name == "accept_rows" && cmd["num_rows"].as_u64().unwrap() > 0 {
                read_frame(&mut stream).unwrap();
            }
            send(
                &mut stream,
                &json!({"response": "error", "error_message": "synthetic failure"}),
            );
            continue;
        }

        let echo = |n: &str| -> String {
            if behavior == Behavior::WrongEcho {
                format!("{n}_oops")
            } else {
                n.to_string()
            }
        };

        match name.as_str() {
            "accept_rows" => {
                let num_rows = cmd["num_rows"].as_u64().unwrap() as usize;
                let body = if num_rows > 0 {
                    String::from_utf8(read_frame(&mut stream).unwrap()).unwrap()
                } else {
                    String::new()
                };
                vars.insert(
                    cmd["row_meta"]["frame_name"].as_str().unwrap().to_string(),
                    Var::Frame {
                        fields: cmd["row_meta"]["fields"].clone(),
                        body,
                        num_rows,
                    },
                );
                send(&mut stream, &json!({"response": "ok"}));
            }
            "get_frame" => {
                let frame_name = cmd["frame_name"].as_str().unwrap();
                match vars.get(frame_name) {
                    Some(Var::Frame {
                        fields,
                        body,
                        num_rows,
                    }) => {
                        send(
                            &mut stream,
                            &json!({
                                "response": "row_meta",
                                "frame_name": echo(frame_name),
                                "fields": fields,
                                "num_rows": num_rows,
                            }),
                        );
                        write_frame(&mut stream, body.as_bytes()).unwrap();
                    }
                    _ => send(
                        &mut stream,
                        &json!({
                            "response": "error",
                            "error_message": format!("variable {frame_name} is not a DataFrame"),
                        }),
                    ),
                }
            }
            "execute_script" => {
                let script = cmd["script"].as_str().unwrap().to_string();
                let mut out = String::new();
                let mut err = String::new();
                for line in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    if line == "fail" {
                        err.push_str("Traceback (most recent call last):\n  boom\n");
                    } else if line == "warn" {
                        err.push_str("Warning: deprecated\nFutureWarning: soon\n");
                    } else if let Some(inner) =
                        line.strip_prefix("print('").and_then(|l| l.strip_suffix("')"))
                    {
                        out.push_str(inner);
                        out.push('\n');
                    } else if let Some((lhs, rhs)) = line.split_once(" = ") {
                        let var = if let Some(text) =
                            rhs.strip_prefix('\'').and_then(|r| r.strip_suffix('\''))
                        {
                            Var::Str(text.to_string())
                        } else if rhs == "figure" {
                            Var::Figure(PNG_MAGIC.to_vec())
                        } else if rhs.parse::<f64>().is_ok() {
                            Var::Num(rhs.to_string())
                        } else {
                            match vars.get(rhs) {
                                Some(Var::Frame {
                                    fields,
                                    body,
                                    num_rows,
                                }) => Var::Frame {
                                    fields: fields.clone(),
                                    body: body.clone(),
                                    num_rows: *num_rows,
                                },
                                Some(Var::Str(s)) => Var::Str(s.clone()),
                                Some(Var::Num(s)) => Var::Num(s.clone()),
                                Some(Var::Figure(b)) => Var::Figure(b.clone()),
                                None => {
                                    err.push_str(&format!(
                                        "NameError: name '{rhs}' is not defined\n"
                                    ));
                                    continue;
                                }
                            }
                        };
                        vars.insert(lhs.to_string(), var);
                    }
                }
                std_out.push_str(&out);
                std_err.push_str(&err);
                send(
                    &mut stream,
                    &json!({"response": "ok", "script_out": out, "script_error": err}),
                );
            }
            "variable_is_set" => {
                let var = cmd["variable_name"].as_str().unwrap();
                send(
                    &mut stream,
                    &json!({
                        "response": "ok",
                        "variable_name": echo(var),
                        "variable_exists": vars.contains_key(var),
                    }),
                );
            }
            "get_variable_type" => {
                let var = cmd["variable_name"].as_str().unwrap();
                let kind = match vars.get(var) {
                    Some(Var::Frame { .. }) => "dataframe",
                    Some(Var::Str(_)) => "string",
                    Some(Var::Num(_)) => "unknown",
                    Some(Var::Figure(_)) => "image",
                    None => "unknown",
                };
                send(
                    &mut stream,
                    &json!({"response": "ok", "variable_name": echo(var), "type": kind}),
                );
            }
            "get_variable_value" => {
                let var = cmd["variable_name"].as_str().unwrap();
                let value = match (vars.get(var), cmd["variable_encoding"].as_str()) {
                    (Some(Var::Str(s)), Some("pickled")) => BASE64.encode(s.as_bytes()),
                    (Some(Var::Str(s)), _) => s.clone(),
                    (Some(Var::Num(s)), _) => s.clone(),
                    (Some(_), _) => "<object>".to_string(),
                    (None, _) => {
                        send(
                            &mut stream,
                            &json!({
                                "response": "error",
                                "error_message": format!("variable {var} is not set"),
                            }),
                        );
                        continue;
                    }
                };
                send(
                    &mut stream,
                    &json!({
                        "response": "ok",
                        "variable_name": echo(var),
                        "variable_value": value,
                    }),
                );
            }
            "get_image" => {
                let var = cmd["variable_name"].as_str().unwrap();
                match vars.get(var) {
                    Some(Var::Figure(bytes)) => send(
                        &mut stream,
                        &json!({
                            "response": "ok",
                            "variable_name": echo(var),
                            "encoding": "base64",
                            "image_data": BASE64.encode(bytes),
                        }),
                    ),
                    _ => send(
                        &mut stream,
                        &json!({
                            "response": "error",
                            "error_message": format!("variable {var} is not a matplotlib figure"),
                        }),
                    ),
                }
            }
            "get_debug_buffer" => {
                send(
                    &mut stream,
                    &json!({
                        "response": "ok",
                        "std_out": std::mem::take(&mut std_out),
                        "std_err": std::mem::take(&mut std_err),
                    }),
                );
            }
            other => send(
                &mut stream,
                &json!({
                    "response": "error",
                    "error_message": format!("unrecognized command: {other}"),
                }),
            ),
        }
    }
}

/// Launch parameters whose probe step runs quietly without a Python
/// interpreter on the machine.
pub fn quiet_config() -> LaunchConfig {
    LaunchConfig::new("true", "/dev/null", "/dev/null")
}
