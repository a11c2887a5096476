// Resumable byte-stream parser for inbound protocol frames.
//
// The server interleaves control lines (INFO, PING, PONG, +OK, -ERR) with
// MSG frames whose payload is a raw byte run of a declared length. Reads
// come off the socket in arbitrary fragments, so the parser is an explicit
// state machine that can stop at any byte and pick up on the next call.
// Argument lines and payloads that straddle a read boundary spill into
// side buffers; everything else is parsed in place.
use bytes::BytesMut;

/// Parsed argument line of a MSG frame: `subject sid [reply] size`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgArgs {
    pub subject: String,
    pub sid: u64,
    pub reply: Option<String>,
    pub size: usize,
}

/// Receiver for completed frames. One `on_msg` per MSG frame, with exactly
/// the payload length the argument line declared.
pub trait FrameSink {
    fn on_msg(&mut self, args: &MsgArgs, payload: &[u8]);
    fn on_info(&mut self, json: &[u8]);
    fn on_ping(&mut self);
    fn on_pong(&mut self);
    fn on_ok(&mut self);
    fn on_err(&mut self, msg: &[u8]);
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid protocol input in {state}: {snippet:?}")]
    Protocol { state: String, snippet: String },
    #[error("malformed MSG argument line: {0:?}")]
    BadMsgArgs(String),
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

/// Incremental protocol parser.
///
/// ```
/// use tern_wire::{FrameSink, MsgArgs, Parser};
///
/// #[derive(Default)]
/// struct Collect(Vec<(MsgArgs, Vec<u8>)>);
/// impl FrameSink for Collect {
///     fn on_msg(&mut self, args: &MsgArgs, payload: &[u8]) {
///         self.0.push((args.clone(), payload.to_vec()));
///     }
///     fn on_info(&mut self, _: &[u8]) {}
///     fn on_ping(&mut self) {}
///     fn on_pong(&mut self) {}
///     fn on_ok(&mut self) {}
///     fn on_err(&mut self, _: &[u8]) {}
/// }
///
/// let mut parser = Parser::new();
/// let mut sink = Collect::default();
/// parser.parse(&mut sink, b"MSG greet 4 5\r\nhello\r\n").expect("parse");
/// assert_eq!(sink.0.len(), 1);
/// assert_eq!(sink.0[0].1, b"hello");
/// ```
#[derive(Debug)]
pub struct Parser {
    state: State,
    // Start of the in-flight argument line or payload within the current
    // input buffer.
    mark: usize,
    // 1 while a '\r' has been seen and must be dropped before the '\n'.
    drop: usize,
    args: MsgArgs,
    arg_buf: Option<BytesMut>,
    msg_buf: Option<BytesMut>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::OpStart,
            mark: 0,
            drop: 0,
            args: MsgArgs::default(),
            arg_buf: None,
            msg_buf: None,
        }
    }

    /// Feed one read's worth of bytes. The sink is invoked inline for every
    /// frame that completes inside `buf`; partial frames are carried over
    /// to the next call.
    pub fn parse<S: FrameSink>(&mut self, sink: &mut S, buf: &[u8]) -> Result<(), ParseError> {
        let mut i = 0;
        while i < buf.len() {
            let b = buf[i];
            match self.state {
                State::OpStart => match b {
                    b'M' | b'm' => self.state = State::OpM,
                    b'P' | b'p' => self.state = State::OpP,
                    b'+' => self.state = State::OpPlus,
                    b'-' => self.state = State::OpMinus,
                    b'I' | b'i' => self.state = State::OpI,
                    _ => return Err(self.fail(buf, i)),
                },

                State::OpM => match b {
                    b'S' | b's' => self.state = State::OpMs,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMs => match b {
                    b'G' | b'g' => self.state = State::OpMsg,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMsg => match b {
                    b' ' | b'\t' => self.state = State::OpMsgSpc,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMsgSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.state = State::MsgArg;
                        self.mark = i;
                        continue;
                    }
                },
                State::MsgArg => match b {
                    b'\r' => self.drop = 1,
                    b'\n' => {
                        self.args = match self.arg_buf.take() {
                            Some(arg) => parse_msg_args(&arg)?,
                            None => parse_msg_args(arg_slice(buf, self.mark, i, self.drop))?,
                        };
                        self.drop = 0;
                        self.mark = i + 1;
                        self.state = State::MsgPayload;
                        // Jump the scan index past the declared payload. If
                        // this overruns the buffer the tail loop below
                        // spills what is present into msg_buf.
                        i = self.mark + self.args.size;
                        continue;
                    }
                    _ => {
                        if let Some(arg) = self.arg_buf.as_mut() {
                            arg.extend_from_slice(&[b]);
                        }
                    }
                },
                State::MsgPayload => {
                    if let Some(mut pending) = self.msg_buf.take() {
                        if pending.len() >= self.args.size {
                            sink.on_msg(&self.args, &pending);
                            self.arg_buf = None;
                            self.state = State::MsgEnd;
                        } else {
                            let need = self.args.size - pending.len();
                            let take = need.min(buf.len() - i);
                            pending.extend_from_slice(&buf[i..i + take]);
                            self.msg_buf = Some(pending);
                            i += take;
                            continue;
                        }
                    } else if i - self.mark >= self.args.size {
                        sink.on_msg(&self.args, &buf[self.mark..i]);
                        self.arg_buf = None;
                        self.state = State::MsgEnd;
                    }
                }
                State::MsgEnd => {
                    if b == b'\n' {
                        self.drop = 0;
                        self.mark = i + 1;
                        self.state = State::OpStart;
                    }
                }

                State::OpP => match b {
                    b'I' | b'i' => self.state = State::OpPi,
                    b'O' | b'o' => self.state = State::OpPo,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPi => match b {
                    b'N' | b'n' => self.state = State::OpPin,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPin => match b {
                    b'G' | b'g' => self.state = State::OpPing,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPing => {
                    if b == b'\n' {
                        sink.on_ping();
                        self.drop = 0;
                        self.state = State::OpStart;
                    }
                }
                State::OpPo => match b {
                    b'N' | b'n' => self.state = State::OpPon,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPon => match b {
                    b'G' | b'g' => self.state = State::OpPong,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPong => {
                    if b == b'\n' {
                        sink.on_pong();
                        self.drop = 0;
                        self.state = State::OpStart;
                    }
                }

                State::OpPlus => match b {
                    b'O' | b'o' => self.state = State::OpPlusO,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPlusO => match b {
                    b'K' | b'k' => self.state = State::OpPlusOk,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPlusOk => {
                    if b == b'\n' {
                        sink.on_ok();
                        self.drop = 0;
                        self.state = State::OpStart;
                    }
                }

                State::OpMinus => match b {
                    b'E' | b'e' => self.state = State::OpMinusE,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMinusE => match b {
                    b'R' | b'r' => self.state = State::OpMinusEr,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMinusEr => match b {
                    b'R' | b'r' => self.state = State::OpMinusErr,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMinusErr => match b {
                    b' ' | b'\t' => self.state = State::OpMinusErrSpc,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMinusErrSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.state = State::MinusErrArg;
                        self.mark = i;
                        continue;
                    }
                },
                State::MinusErrArg => match b {
                    b'\r' => self.drop = 1,
                    b'\n' => {
                        match self.arg_buf.take() {
                            Some(arg) => sink.on_err(&arg),
                            None => sink.on_err(arg_slice(buf, self.mark, i, self.drop)),
                        }
                        self.drop = 0;
                        self.mark = i + 1;
                        self.state = State::OpStart;
                    }
                    _ => {
                        if let Some(arg) = self.arg_buf.as_mut() {
                            arg.extend_from_slice(&[b]);
                        }
                    }
                },

                State::OpI => match b {
                    b'N' | b'n' => self.state = State::OpIn,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpIn => match b {
                    b'F' | b'f' => self.state = State::OpInf,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpInf => match b {
                    b'O' | b'o' => self.state = State::OpInfo,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpInfo => match b {
                    b' ' | b'\t' => self.state = State::OpInfoSpc,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpInfoSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.state = State::InfoArg;
                        self.mark = i;
                        continue;
                    }
                },
                State::InfoArg => match b {
                    b'\r' => self.drop = 1,
                    b'\n' => {
                        match self.arg_buf.take() {
                            Some(arg) => sink.on_info(&arg),
                            None => sink.on_info(arg_slice(buf, self.mark, i, self.drop)),
                        }
                        self.drop = 0;
                        self.mark = i + 1;
                        self.state = State::OpStart;
                    }
                    _ => {
                        if let Some(arg) = self.arg_buf.as_mut() {
                            arg.extend_from_slice(&[b]);
                        }
                    }
                },
            }
            i += 1;
        }

        // Buffer exhausted mid-frame: spill the partial argument line or
        // payload so the next call can resume.
        match self.state {
            State::MsgArg | State::MinusErrArg | State::InfoArg if self.arg_buf.is_none() => {
                let end = buf.len().saturating_sub(self.drop).max(self.mark);
                self.arg_buf = Some(BytesMut::from(&buf[self.mark..end]));
            }
            State::MsgPayload if self.msg_buf.is_none() => {
                let start = self.mark.min(buf.len());
                let mut pending = BytesMut::with_capacity(self.args.size);
                pending.extend_from_slice(&buf[start..]);
                self.msg_buf = Some(pending);
            }
            _ => {}
        }
        Ok(())
    }

    fn fail(&self, buf: &[u8], i: usize) -> ParseError {
        let end = buf.len().min(i + 32);
        ParseError::Protocol {
            state: format!("{:?}", self.state),
            snippet: String::from_utf8_lossy(&buf[i..end]).into_owned(),
        }
    }
}

fn arg_slice<'a>(buf: &'a [u8], mark: usize, i: usize, drop: usize) -> &'a [u8] {
    let end = i.saturating_sub(drop).max(mark);
    &buf[mark..end]
}

fn parse_msg_args(arg: &[u8]) -> Result<MsgArgs, ParseError> {
    let bad = || ParseError::BadMsgArgs(String::from_utf8_lossy(arg).into_owned());
    let text = std::str::from_utf8(arg).map_err(|_| bad())?;
    let tokens: Vec<&str> = text.split_ascii_whitespace().collect();
    let (subject, sid, reply, size) = match tokens.as_slice() {
        [subject, sid, size] => (*subject, *sid, None, *size),
        [subject, sid, reply, size] => (*subject, *sid, Some((*reply).to_string()), *size),
        _ => return Err(bad()),
    };
    Ok(MsgArgs {
        subject: subject.to_string(),
        sid: sid.parse().map_err(|_| bad())?,
        reply,
        size: size.parse().map_err(|_| bad())?,
    })
}
