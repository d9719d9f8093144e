//! JSON-RPC 2.0 envelope and line framing for the MCP stdio transport.
//!
//! One JSON object per line, `\n`-terminated (`\r\n` tolerated). The reader
//! accumulates raw bytes and only parses complete lines; a trailing partial
//! line stays buffered until the next read.

use serde_json::{json, Value};

use maestro_core::{Error, ErrorKind};

/// Protocol version sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const CLIENT_NAME: &str = "maestro";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ── Request builders ─────────────────────────────────────────────────────────

pub fn initialize_request(id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": true } },
            "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
        },
    })
}

pub fn tools_list_request(id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/list",
    })
}

pub fn tools_call_request(id: u64, name: &str, arguments: &Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments },
    })
}

// ── Line framing ─────────────────────────────────────────────────────────────

/// Split complete `\n`-terminated lines out of `buf`, leaving any trailing
/// partial line in place. Strips a trailing `\r` and skips blank lines.
pub fn drain_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop(); // the \n
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}

/// Outcome of parsing one framed line.
#[derive(Debug)]
pub enum LineParse {
    /// A single well-formed JSON object.
    Message(Value),
    /// Not JSON at all; diagnostic noise to log and skip.
    Garbage,
    /// More than one JSON value on a single line. The framing does not permit
    /// this; the provider's stream is unusable from here on.
    Concatenated,
}

pub fn parse_line(line: &str) -> LineParse {
    let mut stream = serde_json::Deserializer::from_str(line).into_iter::<Value>();
    let first = match stream.next() {
        Some(Ok(value)) => value,
        _ => return LineParse::Garbage,
    };
    if line[stream.byte_offset()..].trim().is_empty() {
        LineParse::Message(first)
    } else {
        LineParse::Concatenated
    }
}

// ── Message classification ───────────────────────────────────────────────────

/// What one well-formed message means to the correlator.
#[derive(Debug)]
pub enum Classified {
    /// `result` for a request we issued.
    Result { id: u64, result: Value },
    /// `error` for a request we issued.
    Error { id: u64, error: Error },
    /// Provider finished its side of the handshake.
    Initialized,
    /// Provider's tool list changed; re-fetch.
    ToolsListChanged,
    /// Anything else: warn and drop.
    Unmatched,
}

pub fn classify(message: &Value) -> Classified {
    // Replies carry an id we allocated (always an integer on our side; a
    // string id is nothing we issued).
    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        if let Some(result) = message.get("result") {
            return Classified::Result {
                id,
                result: result.clone(),
            };
        }
        if let Some(error) = message.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let text = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error");
            return Classified::Error {
                id,
                error: rpc_error(code, text),
            };
        }
    }

    match message.get("method").and_then(Value::as_str) {
        Some("initialized") | Some("notifications/initialized") => Classified::Initialized,
        Some("tools/listChanged") | Some("notifications/tools/list_changed") => {
            Classified::ToolsListChanged
        }
        _ => Classified::Unmatched,
    }
}

/// Map a JSON-RPC error object to the taxonomy. The category rides in the
/// message prefix; the kind is `ToolError` for all provider-reported errors.
pub fn rpc_error(code: i64, message: &str) -> Error {
    let category = match code {
        -32601 => "method-not-found",
        -32602 => "invalid-params",
        _ => "generic",
    };
    Error::new(ErrorKind::ToolError, format!("{category}: {message} (code {code})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_lines_keeps_partial_tail() {
        let mut buf = b"{\"a\":1}\n{\"b\":".to_vec();
        let lines = drain_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);
        assert_eq!(buf, b"{\"b\":".to_vec());

        buf.extend_from_slice(b"2}\n");
        let lines = drain_lines(&mut buf);
        assert_eq!(lines, vec!["{\"b\":2}".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_lines_tolerates_crlf_and_blanks() {
        let mut buf = b"{\"a\":1}\r\n\r\n{\"b\":2}\n".to_vec();
        let lines = drain_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[test]
    fn parse_line_flags_concatenated_objects() {
        assert!(matches!(parse_line("{\"a\":1}"), LineParse::Message(_)));
        assert!(matches!(parse_line("not json"), LineParse::Garbage));
        assert!(matches!(
            parse_line("{\"a\":1}{\"b\":2}"),
            LineParse::Concatenated
        ));
        assert!(matches!(
            parse_line("{\"a\":1} trailing"),
            LineParse::Concatenated
        ));
    }

    #[test]
    fn classify_result_and_error() {
        let msg = serde_json::json!({"jsonrpc":"2.0","id":3,"result":{"ok":true}});
        assert!(matches!(classify(&msg), Classified::Result { id: 3, .. }));

        let msg = serde_json::json!({
            "jsonrpc":"2.0","id":4,
            "error":{"code":-32601,"message":"no such method"}
        });
        match classify(&msg) {
            Classified::Error { id, error } => {
                assert_eq!(id, 4);
                assert_eq!(error.kind(), ErrorKind::ToolError);
                assert!(error.message().starts_with("method-not-found"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_notifications() {
        let msg = serde_json::json!({"jsonrpc":"2.0","method":"initialized"});
        assert!(matches!(classify(&msg), Classified::Initialized));

        let msg = serde_json::json!({"jsonrpc":"2.0","method":"tools/listChanged"});
        assert!(matches!(classify(&msg), Classified::ToolsListChanged));

        let msg = serde_json::json!({"jsonrpc":"2.0","method":"resources/updated"});
        assert!(matches!(classify(&msg), Classified::Unmatched));
    }

    #[test]
    fn initialize_request_shape() {
        let req = initialize_request(1);
        assert_eq!(req["method"], "initialize");
        assert_eq!(req["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(req["params"]["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(req["params"]["clientInfo"]["name"], "maestro");
    }

    #[test]
    fn tools_call_request_shape() {
        let args = serde_json::json!({"path": "/tmp/a.txt"});
        let req = tools_call_request(9, "read_file", &args);
        assert_eq!(req["id"], 9);
        assert_eq!(req["params"]["name"], "read_file");
        assert_eq!(req["params"]["arguments"]["path"], "/tmp/a.txt");
    }
}
