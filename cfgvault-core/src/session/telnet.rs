//! Telnet sessions
//!
//! Every option the device offers or requests is refused, so the session stays
//! in plain NVT mode.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use tracing::debug;

use super::driver::{contains_ignore_case, prompt_matches, Hangup, PromptDriver, PromptSession};
use super::{connect_tcp, CliSession, ConnectTarget, SessionConnector};
use crate::error::{CaptureError, ConnectFailure};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

const LOGIN_PROMPTS: [&str; 4] = ["username:", "login:", "user name:", "user:"];
const LOGIN_FAILURES: [&str; 5] = ["incorrect", "failed", "denied", "invalid", "bad password"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IacState {
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Byte stream with Telnet command handling
///
/// Reads strip IAC sequences and answer negotiation (DO → WONT, WILL → DONT);
/// writes escape literal 0xFF.
pub struct TelnetStream<S> {
    inner: S,
    state: IacState,
}

impl<S: Read + Write> TelnetStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: IacState::Data,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Feed raw bytes through the IAC state machine; data bytes go to `out`,
    /// negotiation replies to `replies`.
    fn process(&mut self, raw: &[u8], out: &mut [u8], replies: &mut Vec<u8>) -> usize {
        let mut written = 0;
        for &b in raw {
            self.state = match (self.state, b) {
                (IacState::Data, IAC) => IacState::Iac,
                (IacState::Data, _) => {
                    out[written] = b;
                    written += 1;
                    IacState::Data
                }
                (IacState::Iac, IAC) => {
                    out[written] = IAC;
                    written += 1;
                    IacState::Data
                }
                (IacState::Iac, DO | DONT | WILL | WONT) => IacState::Negotiate(b),
                (IacState::Iac, SB) => IacState::Sub,
                (IacState::Iac, _) => IacState::Data,
                (IacState::Negotiate(verb), option) => {
                    match verb {
                        DO => replies.extend_from_slice(&[IAC, WONT, option]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                    IacState::Data
                }
                (IacState::Sub, IAC) => IacState::SubIac,
                (IacState::Sub, _) => IacState::Sub,
                (IacState::SubIac, SE) => IacState::Data,
                (IacState::SubIac, _) => IacState::Sub,
            };
        }
        written
    }
}

impl<S: Read + Write> Read for TelnetStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut raw = vec![0u8; buf.len()];
        loop {
            let n = self.inner.read(&mut raw)?;
            if n == 0 {
                return Ok(0);
            }
            let mut replies = Vec::new();
            let written = self.process(&raw[..n], buf, &mut replies);
            if !replies.is_empty() {
                self.inner.write_all(&replies)?;
                self.inner.flush()?;
            }
            if written > 0 {
                return Ok(written);
            }
        }
    }
}

impl<S: Read + Write> Write for TelnetStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.contains(&IAC) {
            let mut escaped = Vec::with_capacity(buf.len() + 2);
            for &b in buf {
                escaped.push(b);
                if b == IAC {
                    escaped.push(IAC);
                }
            }
            self.inner.write_all(&escaped)?;
        } else {
            self.inner.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Hangup for TelnetStream<TcpStream> {
    fn hangup(&mut self) {
        if let Err(e) = self.inner.shutdown(Shutdown::Both) {
            debug!(error = %e, "telnet shutdown failed");
        }
    }
}

fn last_line_lower(text: &str) -> String {
    text.rsplit('\n')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_login_prompt(text: &str) -> bool {
    let line = last_line_lower(text);
    LOGIN_PROMPTS.iter().any(|p| line.ends_with(p))
}

fn is_password_prompt(text: &str) -> bool {
    last_line_lower(text).ends_with("password:")
}

fn is_login_failure(text: &str) -> bool {
    LOGIN_FAILURES.iter().any(|p| contains_ignore_case(text, p))
}

/// Logs in over Telnet with username/password prompts
#[derive(Debug, Default, Clone)]
pub struct TelnetConnector;

impl TelnetConnector {
    fn login<S: Read + Write>(
        &self,
        driver: &mut PromptDriver<S>,
        target: &ConnectTarget,
        deadline: Instant,
    ) -> Result<(), CaptureError> {
        let endpoint = target.endpoint();
        let timed_out = |e: CaptureError| {
            CaptureError::connect(ConnectFailure::Timeout, &endpoint, e.to_string())
        };

        let mut text = driver
            .read_until(deadline, "login prompt", |t| {
                is_login_prompt(t) || is_password_prompt(t) || prompt_matches(t, None)
            })
            .map_err(timed_out)?;

        if prompt_matches(&text, None) {
            driver.learn_prompt(&text);
            return Ok(());
        }

        if is_login_prompt(&text) {
            driver.send_line(&target.login_name())?;
            driver
                .read_until(deadline, "password prompt", is_password_prompt)
                .map_err(timed_out)?;
        }

        driver.send_line(&target.password)?;
        text = driver
            .read_until(deadline, "prompt after login", |t| {
                prompt_matches(t, None) || is_login_prompt(t) || is_password_prompt(t)
            })
            .map_err(timed_out)?;

        if !prompt_matches(&text, None) || is_login_failure(&text) {
            return Err(CaptureError::connect(
                ConnectFailure::Authentication,
                endpoint,
                "login rejected",
            ));
        }

        driver.learn_prompt(&text);
        Ok(())
    }
}

impl SessionConnector for TelnetConnector {
    fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn CliSession>, CaptureError> {
        let endpoint = target.endpoint();
        let tcp = connect_tcp(target)?;
        let io_error = |e: io::Error| {
            CaptureError::connect(ConnectFailure::Protocol, &endpoint, e.to_string())
        };
        tcp.set_read_timeout(Some(POLL_TIMEOUT)).map_err(io_error)?;
        tcp.set_write_timeout(Some(target.connect_timeout))
            .map_err(io_error)?;
        tcp.set_nodelay(true).map_err(io_error)?;

        let mut driver = PromptDriver::new(TelnetStream::new(tcp)).with_newline(b"\r\n");
        let deadline = Instant::now() + target.connect_timeout;

        if let Err(e) = self.login(&mut driver, target, deadline) {
            driver.get_mut().hangup();
            return Err(e);
        }

        debug!(endpoint = %endpoint, prompt = ?driver.prompt(), "Telnet session ready");
        Ok(Box::new(PromptSession::new(driver, target.command_timeout)))
    }
}
