//! Incremental protocol parser.
//!
//! A byte-addressed state machine over the inbound stream. The parser
//! consumes whatever slice the reader hands it, accumulating partial
//! argument lines and payloads across calls, and emits completed
//! operations in order. Any split point in the byte stream is legal.
//!
//! Malformed input is a protocol error; the connection reacts by
//! disconnecting.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MsgArgs {
    pub subject: String,
    pub sid: u64,
    pub reply: Option<String>,
    pub hdr_len: usize,
    pub total_len: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ServerOp {
    Info(String),
    /// Complete MSG/HMSG. The payload still holds the raw headers block in
    /// its first `args.hdr_len` bytes.
    Msg { args: MsgArgs, payload: Vec<u8> },
    Ping,
    Pong,
    Ok,
    Err(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OpStart,
    OpPlus,
    OpPlusO,
    OpPlusOk,
    OpMinus,
    OpMinusE,
    OpMinusEr,
    OpMinusErr,
    OpMinusErrSpc,
    MinusErrArg,
    OpM,
    OpMs,
    OpMsg,
    OpMsgSpc,
    MsgArg,
    MsgPayload,
    MsgEnd,
    OpH,
    OpP,
    OpPi,
    OpPin,
    OpPing,
    OpPo,
    OpPon,
    OpPong,
    OpI,
    OpIn,
    OpInf,
    OpInfo,
    OpInfoSpc,
    InfoArg,
}

pub(crate) struct Parser {
    state: State,
    /// Scratch buffer for the argument line being accumulated.
    arg_buf: Vec<u8>,
    /// Payload accumulation for the MSG in flight.
    msg_buf: Vec<u8>,
    msg_args: Option<MsgArgs>,
    /// Header-bearing variant of the current MSG op.
    hdr: bool,
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            state: State::OpStart,
            arg_buf: Vec::with_capacity(256),
            msg_buf: Vec::new(),
            msg_args: None,
            hdr: false,
        }
    }

    /// Consumes `buf` entirely, appending completed operations to `ops`.
    pub fn parse(&mut self, buf: &[u8], ops: &mut Vec<ServerOp>) -> Result<()> {
        let mut i = 0;
        while i < buf.len() {
            let b = buf[i];
            match self.state {
                State::OpStart => match b {
                    b'M' | b'm' => {
                        self.hdr = false;
                        self.state = State::OpM;
                    }
                    b'H' | b'h' => {
                        self.hdr = true;
                        self.state = State::OpH;
                    }
                    b'P' | b'p' => self.state = State::OpP,
                    b'I' | b'i' => self.state = State::OpI,
                    b'+' => self.state = State::OpPlus,
                    b'-' => self.state = State::OpMinus,
                    b'\r' | b'\n' => {}
                    _ => return Err(self.fail(b)),
                },
                State::OpH => match b {
                    b'M' | b'm' => self.state = State::OpM,
                    _ => return Err(self.fail(b)),
                },
                State::OpM => match b {
                    b'S' | b's' => self.state = State::OpMs,
                    _ => return Err(self.fail(b)),
                },
                State::OpMs => match b {
                    b'G' | b'g' => self.state = State::OpMsg,
                    _ => return Err(self.fail(b)),
                },
                State::OpMsg => match b {
                    b' ' | b'\t' => self.state = State::OpMsgSpc,
                    _ => return Err(self.fail(b)),
                },
                State::OpMsgSpc => match b {
                    b' ' | b'\t' => {}
                    b'\r' | b'\n' => return Err(self.fail(b)),
                    _ => {
                        self.arg_buf.clear();
                        self.arg_buf.push(b);
                        self.state = State::MsgArg;
                    }
                },
                State::MsgArg => match b {
                    b'\r' => {}
                    b'\n' => {
                        let args = parse_msg_args(&self.arg_buf, self.hdr)?;
                        self.msg_buf.clear();
                        self.msg_buf.reserve(args.total_len);
                        self.msg_args = Some(args);
                        self.state = State::MsgPayload;
                    }
                    _ => self.arg_buf.push(b),
                },
                State::MsgPayload => {
                    let needed = self
                        .msg_args
                        .as_ref()
                        .map(|a| a.total_len)
                        .unwrap_or(0);
                    let take = (needed - self.msg_buf.len()).min(buf.len() - i);
                    self.msg_buf.extend_from_slice(&buf[i..i + take]);
                    i += take;
                    if self.msg_buf.len() == needed {
                        self.state = State::MsgEnd;
                    }
                    continue;
                }
                State::MsgEnd => match b {
                    b'\r' => {}
                    b'\n' => {
                        let args = self.msg_args.take().expect("msg args present");
                        ops.push(ServerOp::Msg {
                            args,
                            payload: std::mem::take(&mut self.msg_buf),
                        });
                        self.state = State::OpStart;
                    }
                    _ => return Err(self.fail(b)),
                },
                State::OpP => match b {
                    b'I' | b'i' => self.state = State::OpPi,
                    b'O' | b'o' => self.state = State::OpPo,
                    _ => return Err(self.fail(b)),
                },
                State::OpPi => match b {
                    b'N' | b'n' => self.state = State::OpPin,
                    _ => return Err(self.fail(b)),
                },
                State::OpPin => match b {
                    b'G' | b'g' => self.state = State::OpPing,
                    _ => return Err(self.fail(b)),
                },
                State::OpPing => match b {
                    b'\n' => {
                        ops.push(ServerOp::Ping);
                        self.state = State::OpStart;
                    }
                    b'\r' => {}
                    _ => return Err(self.fail(b)),
                },
                State::OpPo => match b {
                    b'N' | b'n' => self.state = State::OpPon,
                    _ => return Err(self.fail(b)),
                },
                State::OpPon => match b {
                    b'G' | b'g' => self.state = State::OpPong,
                    _ => return Err(self.fail(b)),
                },
                State::OpPong => match b {
                    b'\n' => {
                        ops.push(ServerOp::Pong);
                        self.state = State::OpStart;
                    }
                    b'\r' => {}
                    _ => return Err(self.fail(b)),
                },
                State::OpPlus => match b {
                    b'O' | b'o' => self.state = State::OpPlusO,
                    _ => return Err(self.fail(b)),
                },
                State::OpPlusO => match b {
                    b'K' | b'k' => self.state = State::OpPlusOk,
                    _ => return Err(self.fail(b)),
                },
                State::OpPlusOk => match b {
                    b'\n' => {
                        ops.push(ServerOp::Ok);
                        self.state = State::OpStart;
                    }
                    b'\r' => {}
                    _ => return Err(self.fail(b)),
                },
                State::OpMinus => match b {
                    b'E' | b'e' => self.state = State::OpMinusE,
                    _ => return Err(self.fail(b)),
                },
                State::OpMinusE => match b {
                    b'R' | b'r' => self.state = State::OpMinusEr,
                    _ => return Err(self.fail(b)),
                },
                State::OpMinusEr => match b {
                    b'R' | b'r' => self.state = State::OpMinusErr,
                    _ => return Err(self.fail(b)),
                },
                State::OpMinusErr => match b {
                    b' ' | b'\t' => self.state = State::OpMinusErrSpc,
                    _ => return Err(self.fail(b)),
                },
                State::OpMinusErrSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.arg_buf.clear();
                        self.arg_buf.push(b);
                        self.state = State::MinusErrArg;
                    }
                },
                State::MinusErrArg => match b {
                    b'\r' => {}
                    b'\n' => {
                        let reason = err_reason(&self.arg_buf);
                        ops.push(ServerOp::Err(reason));
                        self.arg_buf.clear();
                        self.state = State::OpStart;
                    }
                    _ => self.arg_buf.push(b),
                },
                State::OpI => match b {
                    b'N' | b'n' => self.state = State::OpIn,
                    _ => return Err(self.fail(b)),
                },
                State::OpIn => match b {
                    b'F' | b'f' => self.state = State::OpInf,
                    _ => return Err(self.fail(b)),
                },
                State::OpInf => match b {
                    b'O' | b'o' => self.state = State::OpInfo,
                    _ => return Err(self.fail(b)),
                },
                State::OpInfo => match b {
                    b' ' | b'\t' => self.state = State::OpInfoSpc,
                    _ => return Err(self.fail(b)),
                },
                State::OpInfoSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.arg_buf.clear();
                        self.arg_buf.push(b);
                        self.state = State::InfoArg;
                    }
                },
                State::InfoArg => match b {
                    b'\r' => {}
                    b'\n' => {
                        let json = String::from_utf8_lossy(&self.arg_buf).into_owned();
                        ops.push(ServerOp::Info(json));
                        self.arg_buf.clear();
                        self.state = State::OpStart;
                    }
                    _ => self.arg_buf.push(b),
                },
            }
            i += 1;
        }
        Ok(())
    }

    fn fail(&self, byte: u8) -> Error {
        Error::Protocol(format!(
            "unexpected byte 0x{byte:02x} in state {:?}",
            self.state
        ))
    }
}

fn err_reason(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim().trim_matches('\'').to_string()
}

fn parse_msg_args(raw: &[u8], hdr: bool) -> Result<MsgArgs> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::Protocol("message arguments are not valid utf-8".to_string()))?;
    let fields: Vec<&str> = text.split_ascii_whitespace().collect();
    let bad = || Error::Protocol(format!("bad message arguments: {text}"));

    let (subject, sid, reply, sizes) = match (hdr, fields.len()) {
        (false, 3) => (fields[0], fields[1], None, &fields[2..]),
        (false, 4) => (fields[0], fields[1], Some(fields[2]), &fields[3..]),
        (true, 4) => (fields[0], fields[1], None, &fields[2..]),
        (true, 5) => (fields[0], fields[1], Some(fields[2]), &fields[3..]),
        _ => return Err(bad()),
    };
    let sid = sid.parse::<u64>().map_err(|_| bad())?;
    let (hdr_len, total_len) = if hdr {
        (
            sizes[0].parse::<usize>().map_err(|_| bad())?,
            sizes[1].parse::<usize>().map_err(|_| bad())?,
        )
    } else {
        (0, sizes[0].parse::<usize>().map_err(|_| bad())?)
    };
    if hdr_len > total_len {
        return Err(bad());
    }
    Ok(MsgArgs {
        subject: subject.to_string(),
        sid,
        reply: reply.map(str::to_string),
        hdr_len,
        total_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Vec<ServerOp> {
        let mut parser = Parser::new();
        let mut ops = Vec::new();
        parser.parse(input, &mut ops).unwrap();
        ops
    }

    #[test]
    fn simple_ops() {
        let ops = parse_all(b"PING\r\nPONG\r\n+OK\r\n-ERR 'Stale Connection'\r\n");
        assert_eq!(
            ops,
            vec![
                ServerOp::Ping,
                ServerOp::Pong,
                ServerOp::Ok,
                ServerOp::Err("Stale Connection".to_string()),
            ]
        );
    }

    #[test]
    fn case_insensitive_ops() {
        let ops = parse_all(b"ping\r\npong\r\n");
        assert_eq!(ops, vec![ServerOp::Ping, ServerOp::Pong]);
    }

    #[test]
    fn msg_with_and_without_reply() {
        let ops = parse_all(b"MSG foo 1 5\r\nhello\r\nMSG foo 1 bar 2\r\nhi\r\n");
        match &ops[0] {
            ServerOp::Msg { args, payload } => {
                assert_eq!(args.subject, "foo");
                assert_eq!(args.sid, 1);
                assert_eq!(args.reply, None);
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected op {other:?}"),
        }
        match &ops[1] {
            ServerOp::Msg { args, payload } => {
                assert_eq!(args.reply.as_deref(), Some("bar"));
                assert_eq!(payload, b"hi");
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn hmsg_carries_header_length() {
        let wire = b"HMSG foo 9 inbox 17 21\r\nNATS/1.0\r\na:b\r\n\r\nbody\r\n";
        let ops = parse_all(wire);
        match &ops[0] {
            ServerOp::Msg { args, payload } => {
                assert_eq!(args.hdr_len, 17);
                assert_eq!(args.total_len, 21);
                assert_eq!(&payload[17..], b"body");
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn empty_payload() {
        let ops = parse_all(b"MSG foo 7 0\r\n\r\n");
        match &ops[0] {
            ServerOp::Msg { args, payload } => {
                assert_eq!(args.total_len, 0);
                assert!(payload.is_empty());
                assert_eq!(args.sid, 7);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn info_json() {
        let ops = parse_all(b"INFO {\"server_id\":\"abc\"}\r\n");
        assert_eq!(ops, vec![ServerOp::Info("{\"server_id\":\"abc\"}".to_string())]);
    }

    #[test]
    fn split_anywhere_equals_whole_feed() {
        let wire: &[u8] =
            b"INFO {\"proto\":1}\r\nMSG a.b 12 inbox.x 11\r\nhello world\r\nPING\r\n+OK\r\nHMSG h 3 12 12\r\nNATS/1.0\r\n\r\n\r\nPONG\r\n";
        let expect = parse_all(wire);
        for split in 1..wire.len() {
            let mut parser = Parser::new();
            let mut ops = Vec::new();
            parser.parse(&wire[..split], &mut ops).unwrap();
            parser.parse(&wire[split..], &mut ops).unwrap();
            assert_eq!(ops, expect, "split at {split}");
        }
    }

    #[test]
    fn payload_binary_safe() {
        // Payload bytes that look like protocol ops must pass through.
        let wire = b"MSG b 1 12\r\nPING\r\nPONG\r\n\r\n";
        let ops = parse_all(wire);
        match &ops[0] {
            ServerOp::Msg { payload, .. } => assert_eq!(payload, b"PING\r\nPONG\r\n"),
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn malformed_input_is_protocol_error() {
        let mut parser = Parser::new();
        let mut ops = Vec::new();
        assert!(matches!(
            parser.parse(b"BOGUS\r\n", &mut ops),
            Err(Error::Protocol(_))
        ));

        let mut parser = Parser::new();
        assert!(parser.parse(b"MSG foo nan 3\r\n", &mut ops).is_err());

        // hdr_len larger than total_len
        let mut parser = Parser::new();
        assert!(parser.parse(b"HMSG foo 1 30 20\r\n", &mut ops).is_err());
    }

    #[test]
    fn large_arg_line_spills_to_heap() {
        let subject = "x".repeat(4096);
        let wire = format!("MSG {subject} 1 2\r\nok\r\n");
        let ops = parse_all(wire.as_bytes());
        match &ops[0] {
            ServerOp::Msg { args, .. } => assert_eq!(args.subject.len(), 4096),
            other => panic!("unexpected op {other:?}"),
        }
    }
}
