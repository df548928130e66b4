//! Mock tool process speaking newline-delimited JSON-RPC 2.0 over stdio.
//!
//! Tools:
//! - `echo`: returns its arguments
//! - `sleep`: replies after `arguments.ms` milliseconds, on its own thread
//! - `fail`: returns a JSON-RPC error
//! - `crash`: exits the process without replying
//! - `pid`: returns this process's id
//!
//! Flags: `--silent` never answers `initialize`, `--noisy` writes garbage
//! lines at startup, `--exit-immediately` exits before reading anything.
//! `--crash-first N --state-file PATH` exits on the first N `tools/call`
//! requests, counted in PATH so the count survives restarts.

use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Output = Arc<Mutex<io::Stdout>>;

/// Tool calls to crash on, shared by every process using the same file.
struct CrashBudget {
    calls: u32,
    state_file: Option<PathBuf>,
}

impl CrashBudget {
    /// Use up one crash if any remain.
    fn take(&self) -> bool {
        let Some(path) = &self.state_file else {
            return false;
        };
        let used: u32 = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        if used >= self.calls {
            return false;
        }
        let _ = std::fs::write(path, (used + 1).to_string());
        true
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let flag = |name: &str| args.iter().any(|a| a == name);

    if flag("--exit-immediately") {
        eprintln!("mock-tool-server: refusing to start");
        std::process::exit(2);
    }
    let silent = flag("--silent");
    let value_of = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };
    let crashes = CrashBudget {
        calls: value_of("--crash-first")
            .and_then(|n| n.parse().ok())
            .unwrap_or(0),
        state_file: value_of("--state-file").map(PathBuf::from),
    };

    let out: Output = Arc::new(Mutex::new(io::stdout()));
    if flag("--noisy") {
        write_line(&out, "this is not json");
        write_line(&out, r#"{"jsonrpc":"2.0","id":"not-a-number","result":{}}"#);
        write_line(&out, r#"{"jsonrpc":"2.0","id":424242,"result":{}}"#);
    }

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock-tool-server: undecodable input: {line}");
            continue;
        };
        // Notifications carry no id and get no reply
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match message["method"].as_str().unwrap_or_default() {
            "initialize" if silent => {}
            "initialize" => reply(
                &out,
                id,
                Ok(json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {"name": "mock-tool-server", "version": "1.0.0"},
                    "capabilities": {"tools": {}, "resources": {}},
                })),
            ),
            "tools/list" => reply(&out, id, Ok(tools())),
            "resources/list" => reply(
                &out,
                id,
                Ok(json!({
                    "resources": [{
                        "uri": "mock://greeting",
                        "name": "greeting",
                        "mimeType": "text/plain",
                    }]
                })),
            ),
            "resources/read" => {
                let outcome = match params["uri"].as_str() {
                    Some("mock://greeting") => Ok(json!({
                        "contents": [{
                            "uri": "mock://greeting",
                            "mimeType": "text/plain",
                            "text": "hello",
                        }]
                    })),
                    other => Err((-32002, format!("Resource not found: {other:?}"))),
                };
                reply(&out, id, outcome);
            }
            "tools/call" if crashes.take() => std::process::exit(3),
            "tools/call" => call_tool(&out, id, &params),
            other => reply(&out, id, Err((-32601, format!("Method not found: {other}")))),
        }
    }
}

fn tools() -> Value {
    let schema = json!({"type": "object"});
    json!({
        "tools": [
            {"name": "echo", "description": "Return the arguments", "inputSchema": schema},
            {"name": "sleep", "description": "Reply after `ms` milliseconds", "inputSchema": schema},
            {"name": "fail", "description": "Always fails", "inputSchema": schema},
            {"name": "crash", "description": "Exit the process", "inputSchema": schema},
            {"name": "pid", "description": "Report the process id", "inputSchema": schema},
        ]
    })
}

fn call_tool(out: &Output, id: Value, params: &Value) {
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
    match params["name"].as_str().unwrap_or_default() {
        "echo" => reply(out, id, Ok(arguments)),
        "sleep" => {
            let ms = arguments["ms"].as_u64().unwrap_or(100);
            let out = Arc::clone(out);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(ms));
                reply(&out, id, Ok(json!({"slept_ms": ms})));
            });
        }
        "fail" => {
            let message = arguments["message"].as_str().unwrap_or("tool failed");
            reply(out, id, Err((-32000, message.to_string())));
        }
        "crash" => std::process::exit(3),
        "pid" => reply(out, id, Ok(json!({"pid": std::process::id()}))),
        other => reply(out, id, Err((-32602, format!("Unknown tool: {other}")))),
    }
}

fn reply(out: &Output, id: Value, outcome: Result<Value, (i64, String)>) {
    let message = match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }),
    };
    write_line(out, &message.to_string());
}

fn write_line(out: &Output, line: &str) {
    if let Ok(mut stdout) = out.lock() {
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}
