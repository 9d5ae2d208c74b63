/*!
Prompt-driven CLI engine shared by the SSH and Telnet sessions.

The driver only ever writes what it is asked to write, plus a single space
when the device shows a pager prompt. All waits take an absolute deadline.
*/

use std::borrow::Cow;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::CliSession;
use crate::error::CaptureError;

/// Characters a CLI prompt line ends with
pub const PROMPT_TERMINATORS: [char; 4] = ['#', '>', ']', '$'];

/// Pager markers that are answered with a single space
pub const PAGER_MARKERS: [&str; 2] = ["---- More ----", "--More--"];

const PAGER_KEYSTROKE: &[u8] = b" ";
const IDLE_WAIT: Duration = Duration::from_millis(10);
const CHUNK: usize = 4096;
/// Bytes at the end of the buffer that completion checks look at
const COMPLETION_WINDOW: usize = 2048;

enum ReadStatus {
    Data,
    Idle,
    Closed,
}

/// Expect-style driver over a byte stream
///
/// The stream must not block forever on `read`; sockets are configured with a
/// short read timeout and report `WouldBlock`/`TimedOut` when idle.
pub struct PromptDriver<S> {
    stream: S,
    buffer: Vec<u8>,
    pager_scan_from: usize,
    newline: &'static [u8],
    prompt: Option<String>,
}

impl<S: Read + Write> PromptDriver<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            pager_scan_from: 0,
            newline: b"\n",
            prompt: None,
        }
    }

    /// Line terminator written after each line (`\r\n` for Telnet)
    pub fn with_newline(mut self, newline: &'static [u8]) -> Self {
        self.newline = newline;
        self
    }

    /// The prompt seen most recently, once one has been learned
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn send_line(&mut self, line: &str) -> Result<(), CaptureError> {
        self.write_raw(line.as_bytes())?;
        self.write_raw(self.newline)?;
        self.stream
            .flush()
            .map_err(|e| CaptureError::capture(format!("session write failed: {e}")))
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), CaptureError> {
        self.stream
            .write_all(bytes)
            .map_err(|e| CaptureError::capture(format!("session write failed: {e}")))
    }

    fn fill(&mut self) -> Result<ReadStatus, CaptureError> {
        let mut chunk = [0u8; CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => Ok(ReadStatus::Closed),
            Ok(n) => {
                trace!(bytes = n, "session read");
                self.buffer.extend_from_slice(&chunk[..n]);
                Ok(ReadStatus::Data)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadStatus::Idle)
            }
            Err(e) => Err(CaptureError::capture(format!("session read failed: {e}"))),
        }
    }

    /// Answer a pager marker sitting at the end of the buffer.
    fn answer_pager(&mut self) -> Result<(), CaptureError> {
        let tail_start = self.buffer[self.pager_scan_from..]
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(self.pager_scan_from, |i| self.pager_scan_from + i + 1);
        let tail = String::from_utf8_lossy(&self.buffer[tail_start..]);

        if PAGER_MARKERS.iter().any(|marker| tail.contains(marker)) {
            debug!("Pager prompt seen, sending keystroke");
            self.write_raw(PAGER_KEYSTROKE)?;
            self.stream
                .flush()
                .map_err(|e| CaptureError::capture(format!("session write failed: {e}")))?;
            self.pager_scan_from = self.buffer.len();
        }
        Ok(())
    }

    /// The end of the buffer, at most [`COMPLETION_WINDOW`] bytes.
    fn tail_window(&self) -> Cow<'_, str> {
        let start = self.buffer.len().saturating_sub(COMPLETION_WINDOW);
        String::from_utf8_lossy(&self.buffer[start..])
    }

    fn take_buffer(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        self.pager_scan_from = 0;
        text
    }

    /// Read until `done` accepts the end of the accumulated text.
    ///
    /// `done` sees only the last [`COMPLETION_WINDOW`] bytes and is asked again
    /// only after new data arrives. Returns `Ok(Some(text))` with the whole
    /// buffer on a match, `Ok(None)` when the deadline passes.
    fn read_inner<F>(&mut self, deadline: Instant, what: &str, done: F) -> Result<Option<String>, CaptureError>
    where
        F: Fn(&str) -> bool,
    {
        let mut closed = false;
        let mut checked_len = None;
        loop {
            self.answer_pager()?;
            if checked_len != Some(self.buffer.len()) {
                checked_len = Some(self.buffer.len());
                if done(&self.tail_window()) {
                    return Ok(Some(self.take_buffer()));
                }
            }
            if closed {
                return Err(CaptureError::capture(format!(
                    "session closed by device while waiting for {what}"
                )));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match self.fill()? {
                ReadStatus::Data => {}
                ReadStatus::Idle => std::thread::sleep(IDLE_WAIT),
                ReadStatus::Closed => closed = true,
            }
        }
    }

    /// Read until `done` matches or fail with a capture error at the deadline
    pub fn read_until<F>(&mut self, deadline: Instant, what: &str, done: F) -> Result<String, CaptureError>
    where
        F: Fn(&str) -> bool,
    {
        self.read_inner(deadline, what, done)?.ok_or_else(|| {
            CaptureError::capture(format!("timed out waiting for {what}"))
        })
    }

    /// Wait for any CLI prompt and remember it
    pub fn wait_for_prompt(&mut self, deadline: Instant) -> Result<String, CaptureError> {
        let text = self.read_until(deadline, "CLI prompt", |t| prompt_matches(t, None))?;
        self.learn_prompt(&text);
        Ok(text)
    }

    /// Remember the last line of `text` as the session prompt
    pub fn learn_prompt(&mut self, text: &str) {
        self.prompt = last_line(text);
        debug!(prompt = ?self.prompt, "Prompt learned");
    }

    /// Send one command and return its output without echo or trailing prompt
    pub fn run(&mut self, command: &str, timeout: Duration) -> Result<String, CaptureError> {
        let deadline = Instant::now() + timeout;
        self.send_line(command)?;

        let prompt = self.prompt.clone();
        let raw = self
            .read_inner(deadline, "command output", move |t| {
                prompt_matches(t, prompt.as_deref())
            })?
            .ok_or_else(|| {
                CaptureError::capture(format!(
                    "command did not complete within {:.1} seconds",
                    timeout.as_secs_f64()
                ))
            })?;

        Ok(strip_echo_and_prompt(&clean_output(&raw), command))
    }

    /// Enter privileged mode with `secret`
    pub fn elevate(&mut self, secret: &str, timeout: Duration) -> Result<(), CaptureError> {
        let deadline = Instant::now() + timeout;
        self.send_line("enable")?;
        let mut text = self.read_until(deadline, "enable response", |t| {
            contains_ignore_case(t, "password") || prompt_matches(t, None)
        })?;

        if contains_ignore_case(&text, "password") && !prompt_matches(&text, None) {
            self.send_line(secret)?;
            text = self.read_until(deadline, "privileged prompt", |t| prompt_matches(t, None))?;
        }

        self.prompt = last_line(&text);
        match self.prompt.as_deref() {
            Some(p) if p.ends_with('#') => Ok(()),
            _ => Err(CaptureError::capture("privilege elevation was refused")),
        }
    }

    /// Send a command that starts work on the device and drain output for up to
    /// `grace`; never waits for the work itself to finish.
    pub fn trigger(&mut self, command: &str, grace: Duration) -> Result<String, CaptureError> {
        let deadline = Instant::now() + grace;
        self.send_line(command)?;

        let prompt = self.prompt.clone();
        let text = match self.read_inner(deadline, "trigger response", move |t| {
            prompt_matches(t, prompt.as_deref())
        })? {
            Some(text) => text,
            None => self.take_buffer(),
        };
        Ok(strip_echo_and_prompt(&clean_output(&text), command))
    }
}

/// True when `haystack` contains `needle`, ASCII case-insensitive
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

/// Last line of `text` after terminal cleanup, trimmed
fn last_line(text: &str) -> Option<String> {
    clean_output(text)
        .rsplit('\n')
        .next()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

/// Does the text end in a prompt?
///
/// A prompt is the unterminated last line; bare one-character lines (Huawei's
/// `#` separators) never count. With a learned prompt only an exact match counts.
pub fn prompt_matches(text: &str, learned: Option<&str>) -> bool {
    let raw_tail = text.rsplit('\n').next().unwrap_or(text);
    let tail = clean_output(raw_tail);
    let tail = tail.trim();
    if tail.chars().count() < 2 {
        return false;
    }
    match learned {
        Some(prompt) => tail == prompt,
        None => tail.ends_with(PROMPT_TERMINATORS),
    }
}

/// Apply terminal control sequences the way a dumb terminal would
///
/// Backspace and cursor-left (`ESC [ n D`) erase within the current line,
/// other CSI sequences are dropped, carriage returns are removed and any
/// pager marker that was never erased is cut out.
pub fn clean_output(raw: &str) -> String {
    fn erase(out: &mut String, n: usize) {
        for _ in 0..n {
            match out.chars().last() {
                None | Some('\n') => break,
                Some(_) => {
                    out.pop();
                }
            }
        }
    }

    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => {
                if chars.peek() != Some(&'[') {
                    continue;
                }
                chars.next();
                let mut param = String::new();
                let mut final_byte = None;
                for n in chars.by_ref() {
                    if ('@'..='~').contains(&n) {
                        final_byte = Some(n);
                        break;
                    }
                    param.push(n);
                }
                if final_byte == Some('D') {
                    erase(&mut out, param.parse().unwrap_or(1));
                }
            }
            '\x08' => erase(&mut out, 1),
            '\r' | '\0' => {}
            _ => out.push(c),
        }
    }

    for marker in PAGER_MARKERS {
        if out.contains(marker) {
            out = out.replace(marker, "");
        }
    }
    out
}

/// Drop the echoed command line and the trailing prompt line
fn strip_echo_and_prompt(cleaned: &str, command: &str) -> String {
    let mut lines: Vec<&str> = cleaned.split('\n').collect();

    if !command.is_empty() {
        if let Some(first) = lines.first() {
            if first.trim_end().ends_with(command.trim()) {
                lines.remove(0);
            }
        }
    }
    if let Some(last) = lines.last() {
        let trimmed = last.trim();
        if trimmed.chars().count() >= 2 && trimmed.ends_with(PROMPT_TERMINATORS) {
            lines.pop();
        }
    }

    let body = lines.join("\n");
    body.trim_matches('\n').to_string()
}

/// Implemented by streams that can be hung up
pub trait Hangup {
    fn hangup(&mut self);
}

/// A [`CliSession`] backed by a [`PromptDriver`]
pub struct PromptSession<S: Read + Write + Hangup + Send> {
    driver: PromptDriver<S>,
    elevate_timeout: Duration,
    closed: bool,
}

impl<S: Read + Write + Hangup + Send> PromptSession<S> {
    pub fn new(driver: PromptDriver<S>, elevate_timeout: Duration) -> Self {
        Self {
            driver,
            elevate_timeout,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), CaptureError> {
        if self.closed {
            return Err(CaptureError::capture("session already closed"));
        }
        Ok(())
    }
}

impl<S: Read + Write + Hangup + Send> CliSession for PromptSession<S> {
    fn elevate(&mut self, secret: &str) -> Result<(), CaptureError> {
        self.ensure_open()?;
        self.driver.elevate(secret, self.elevate_timeout)
    }

    fn run(&mut self, command: &str, timeout: Duration) -> Result<String, CaptureError> {
        self.ensure_open()?;
        self.driver.run(command, timeout)
    }

    fn trigger(&mut self, command: &str, grace: Duration) -> Result<String, CaptureError> {
        self.ensure_open()?;
        self.driver.trigger(command, grace)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.get_mut().hangup();
            debug!("Session closed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::session::SessionGuard;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory device: replies are released when the written bytes end
    /// with the next expected trigger.
    pub(crate) struct ScriptedStream {
        outgoing: VecDeque<u8>,
        script: VecDeque<(Vec<u8>, Vec<u8>)>,
        pending: Vec<u8>,
        pub(crate) written: Vec<u8>,
        close_when_done: bool,
        hangups: Arc<AtomicUsize>,
    }

    impl ScriptedStream {
        pub(crate) fn new(banner: &str) -> Self {
            Self {
                outgoing: banner.bytes().collect(),
                script: VecDeque::new(),
                pending: Vec::new(),
                written: Vec::new(),
                close_when_done: false,
                hangups: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn on(mut self, trigger: &str, reply: &str) -> Self {
            self.script
                .push_back((trigger.as_bytes().to_vec(), reply.as_bytes().to_vec()));
            self
        }

        pub(crate) fn close_when_done(mut self) -> Self {
            self.close_when_done = true;
            self
        }

        pub(crate) fn hangups(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.hangups)
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.outgoing.is_empty() {
                if self.close_when_done && self.script.is_empty() {
                    return Ok(0);
                }
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "idle"));
            }
            let n = buf.len().min(self.outgoing.len());
            for (slot, byte) in buf.iter_mut().zip(self.outgoing.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            self.pending.extend_from_slice(buf);
            if let Some((trigger, _)) = self.script.front() {
                if self.pending.ends_with(trigger) {
                    if let Some((_, reply)) = self.script.pop_front() {
                        self.outgoing.extend(reply);
                    }
                    self.pending.clear();
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Hangup for ScriptedStream {
        fn hangup(&mut self) {
            self.hangups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[test]
    fn test_prompt_detection() {
        assert!(prompt_matches("banner\r\nRouter>", None));
        assert!(prompt_matches("[admin@MikroTik] > ", None));
        assert!(prompt_matches("<HUAWEI>", None));
        assert!(prompt_matches("ZXAN#", None));
        assert!(!prompt_matches("sysname X\r\n#\r\n", None));
        assert!(!prompt_matches("#", None));
        assert!(!prompt_matches("Password: ", None));
        assert!(prompt_matches("x\nRouter#", Some("Router#")));
        assert!(!prompt_matches("x\nOther#", Some("Router#")));
    }

    #[test]
    fn test_clean_output_handles_backspace_and_cursor_left() {
        let cisco = "a\r\n --More-- \x08\x08\x08\x08\x08\x08\x08\x08\x08\x08          \x08\x08\x08\x08\x08\x08\x08\x08\x08\x08b\r\n";
        assert_eq!(clean_output(cisco), "a\nb\n");

        let huawei = "a\r\n  ---- More ----\x1b[42D                                          \x1b[42Db\r\n";
        assert_eq!(clean_output(huawei), "a\nb\n");

        assert_eq!(clean_output("x\x1b[0mY\x1b[K\r\n"), "xY\n");
        assert_eq!(clean_output("left --More--"), "left ");
    }

    #[test]
    fn test_wait_for_prompt_learns_prompt() {
        let stream = ScriptedStream::new("Welcome to R1\r\nRouter>");
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();
        assert_eq!(driver.prompt(), Some("Router>"));
    }

    #[test]
    fn test_run_strips_echo_and_prompt() {
        let stream = ScriptedStream::new("Router#").on(
            "show running-config\n",
            "show running-config\r\nhostname R1\r\ninterface Gi0/1\r\nRouter#",
        );
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();

        let output = driver
            .run("show running-config", Duration::from_secs(2))
            .unwrap();
        assert_eq!(output, "hostname R1\ninterface Gi0/1");
    }

    #[test]
    fn test_pager_is_answered_with_a_space_only() {
        let stream = ScriptedStream::new("Router#")
            .on(
                "show running-config\n",
                "show running-config\r\nline1\r\n --More-- ",
            )
            .on(
                " ",
                "\x08\x08\x08\x08\x08\x08\x08\x08\x08\x08          \x08\x08\x08\x08\x08\x08\x08\x08\x08\x08line2\r\nRouter#",
            );
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();

        let output = driver
            .run("show running-config", Duration::from_secs(2))
            .unwrap();
        assert_eq!(output, "line1\nline2");
        assert_eq!(driver.get_mut().written, b"show running-config\n ".to_vec());
    }

    #[test]
    fn test_huawei_pager() {
        let stream = ScriptedStream::new("<HUAWEI>")
            .on(
                "display current-configuration\n",
                "display current-configuration\r\n#\r\nsysname HUAWEI\r\n  ---- More ----",
            )
            .on(
                " ",
                "\x1b[42D                                          \x1b[42D#\r\nreturn\r\n<HUAWEI>",
            );
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();

        let output = driver
            .run("display current-configuration", Duration::from_secs(2))
            .unwrap();
        assert_eq!(output, "#\nsysname HUAWEI\n#\nreturn");
    }

    #[test]
    fn test_large_output_is_checked_on_a_bounded_tail() {
        let mut body = String::new();
        for i in 0..30_000 {
            body.push_str(&format!("interface Gi0/{i}\r\n description uplink {i}\r\n"));
        }
        let reply = format!("show running-config\r\n{body}Router#");
        let stream = ScriptedStream::new("Router#").on("show running-config\n", &reply);
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();
        driver.send_line("show running-config").unwrap();

        let longest = std::cell::Cell::new(0usize);
        let checks = std::cell::Cell::new(0usize);
        let text = driver
            .read_until(soon(), "command output", |t| {
                longest.set(longest.get().max(t.len()));
                checks.set(checks.get() + 1);
                prompt_matches(t, Some("Router#"))
            })
            .unwrap();

        assert!(text.len() > 1_000_000);
        assert!(text.ends_with("Router#"));
        assert!(longest.get() <= COMPLETION_WINDOW + 3);
        assert!(checks.get() <= text.len() / CHUNK + 2);
    }

    #[test]
    fn test_run_deadline_is_capture_error() {
        let stream = ScriptedStream::new("Router#");
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();

        let started = Instant::now();
        let err = driver
            .run("show running-config", Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Capture);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_device_hangup_mid_output() {
        let stream = ScriptedStream::new("Router#")
            .on("show running-config\n", "show running-config\r\npartial")
            .close_when_done();
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();

        let err = driver
            .run("show running-config", Duration::from_secs(2))
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_elevate_with_secret() {
        let stream = ScriptedStream::new("Router>")
            .on("enable\n", "enable\r\nPassword: ")
            .on("s3cret\n", "\r\nRouter#");
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();

        driver.elevate("s3cret", Duration::from_secs(2)).unwrap();
        assert_eq!(driver.prompt(), Some("Router#"));
    }

    #[test]
    fn test_elevate_refused() {
        let stream = ScriptedStream::new("Router>")
            .on("enable\n", "enable\r\nPassword: ")
            .on("wrong\n", "\r\n% Access denied\r\n\r\nRouter>");
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();

        let err = driver.elevate("wrong", Duration::from_secs(2)).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Capture);
    }

    #[test]
    fn test_trigger_returns_after_grace() {
        let stream = ScriptedStream::new("ZXAN#").on("file upload x\n", "file upload x\r\n");
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();

        let started = Instant::now();
        let output = driver
            .trigger("file upload x", Duration::from_millis(100))
            .unwrap();
        assert!(output.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_trigger_returns_at_prompt() {
        let stream = ScriptedStream::new("ZXAN#").on(
            "file upload x\n",
            "file upload x\r\nStarting upload...\r\nZXAN#",
        );
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();

        let output = driver.trigger("file upload x", Duration::from_secs(5)).unwrap();
        assert_eq!(output, "Starting upload...");
    }

    #[test]
    fn test_guard_closes_session_once() {
        let stream = ScriptedStream::new("Router#");
        let hangups = stream.hangups();
        let mut driver = PromptDriver::new(stream);
        driver.wait_for_prompt(soon()).unwrap();

        let session = PromptSession::new(driver, Duration::from_secs(1));
        {
            let mut guard = SessionGuard::new(Box::new(session));
            guard.close();
            assert!(guard.run("show version", Duration::from_millis(10)).is_err());
        }
        assert_eq!(hangups.load(Ordering::SeqCst), 1);
    }
}
