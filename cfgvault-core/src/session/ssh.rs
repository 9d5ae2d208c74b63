//! SSH sessions over libssh2
//!
//! Host keys are not verified.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use ssh2::{Channel, HashType, KeyboardInteractivePrompt, MethodType, Prompt, Session};
use tracing::{debug, warn};

use super::driver::{Hangup, PromptDriver, PromptSession};
use super::{connect_tcp, CliSession, ConnectTarget, SessionConnector};
use crate::error::{CaptureError, ConnectFailure};

/// Key exchange preference, newest first, legacy SHA-1 groups last
pub const KEX_PREFERENCE: &str = "curve25519-sha256,curve25519-sha256@libssh.org,\
ecdh-sha2-nistp256,ecdh-sha2-nistp384,ecdh-sha2-nistp521,\
diffie-hellman-group-exchange-sha256,diffie-hellman-group16-sha512,\
diffie-hellman-group18-sha512,diffie-hellman-group14-sha256,\
diffie-hellman-group14-sha1,diffie-hellman-group-exchange-sha1,diffie-hellman-group1-sha1";

pub const HOSTKEY_PREFERENCE: &str = "ssh-ed25519,ecdsa-sha2-nistp256,ecdsa-sha2-nistp384,\
ecdsa-sha2-nistp521,rsa-sha2-512,rsa-sha2-256,ssh-rsa,ssh-dss";

/// Read timeout while the shell is idle, so the driver can check its deadlines
const POLL_TIMEOUT_MS: u32 = 200;

/// Terminal geometry: wide enough that config lines are not wrapped
const PTY_SIZE: (u32, u32, u32, u32) = (511, 100, 0, 0);

/// Interactive shell channel plus the session that owns it
pub struct SshShell {
    session: Session,
    channel: Channel,
}

impl Read for SshShell {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }
}

impl Write for SshShell {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.channel.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.channel.flush()
    }
}

impl Hangup for SshShell {
    fn hangup(&mut self) {
        if let Err(e) = self.channel.send_eof() {
            debug!(error = %e, "send_eof failed");
        }
        if let Err(e) = self.channel.close() {
            debug!(error = %e, "channel close failed");
        }
        if let Err(e) = self.session.disconnect(None, "capture complete", None) {
            debug!(error = %e, "ssh disconnect failed");
        }
    }
}

/// Answers every keyboard-interactive prompt with the password
struct PasswordPrompter<'a> {
    password: &'a str,
}

impl KeyboardInteractivePrompt for PasswordPrompter<'_> {
    fn prompt<'b>(&mut self, _username: &str, _instructions: &str, prompts: &[Prompt<'b>]) -> Vec<String> {
        prompts.iter().map(|_| self.password.to_string()).collect()
    }
}

fn is_timeout(err: ssh2::Error) -> bool {
    io::Error::from(err).kind() == io::ErrorKind::TimedOut
}

/// Opens password-authenticated PTY shells
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

impl SshConnector {
    fn handshake(&self, target: &ConnectTarget) -> Result<Session, CaptureError> {
        let endpoint = target.endpoint();
        let tcp = connect_tcp(target)?;

        let mut session = Session::new().map_err(|e| {
            CaptureError::connect(ConnectFailure::Protocol, &endpoint, e.to_string())
        })?;
        session.set_timeout(target.connect_timeout.as_millis().min(u32::MAX as u128) as u32);

        for (method, preference) in [
            (MethodType::Kex, KEX_PREFERENCE),
            (MethodType::HostKey, HOSTKEY_PREFERENCE),
        ] {
            if let Err(e) = session.method_pref(method, preference) {
                warn!(endpoint = %endpoint, error = %e, "Could not set SSH algorithm preference");
            }
        }

        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| {
            let message = e.to_string();
            let kind = if is_timeout(e) {
                ConnectFailure::Timeout
            } else {
                ConnectFailure::Protocol
            };
            CaptureError::connect(kind, &endpoint, message)
        })?;

        if let Some(hash) = session.host_key_hash(HashType::Sha256) {
            let fingerprint: String = hash.iter().map(|b| format!("{b:02x}")).collect();
            debug!(endpoint = %endpoint, fingerprint, "Host key accepted without verification");
        }

        Ok(session)
    }

    fn authenticate(&self, session: &Session, target: &ConnectTarget) -> Result<(), CaptureError> {
        let endpoint = target.endpoint();
        let login = target.login_name();

        let password_result = session.userauth_password(&login, &target.password);
        if password_result.is_err() && !session.authenticated() {
            let interactive = session
                .auth_methods(&login)
                .map(|methods| methods.contains("keyboard-interactive"))
                .unwrap_or(false);
            if interactive {
                let mut prompter = PasswordPrompter {
                    password: &target.password,
                };
                // Failure is reported through `authenticated()` below.
                let _ = session.userauth_keyboard_interactive(&login, &mut prompter);
            }
        }

        if !session.authenticated() {
            let detail = password_result
                .err()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "credentials rejected".to_string());
            return Err(CaptureError::connect(
                ConnectFailure::Authentication,
                endpoint,
                detail,
            ));
        }
        Ok(())
    }

    fn open_shell(&self, session: &Session, target: &ConnectTarget) -> Result<Channel, CaptureError> {
        let endpoint = target.endpoint();
        let protocol = |e: ssh2::Error| {
            CaptureError::connect(ConnectFailure::Protocol, &endpoint, e.to_string())
        };

        let mut channel = session.channel_session().map_err(protocol)?;
        channel
            .request_pty("vt100", None, Some(PTY_SIZE))
            .map_err(protocol)?;
        channel.shell().map_err(protocol)?;
        Ok(channel)
    }
}

impl SessionConnector for SshConnector {
    fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn CliSession>, CaptureError> {
        let started = Instant::now();
        let session = self.handshake(target)?;
        self.authenticate(&session, target)?;
        let channel = self.open_shell(&session, target)?;

        session.set_timeout(POLL_TIMEOUT_MS);
        let mut driver = PromptDriver::new(SshShell { session, channel });

        let remaining = target
            .connect_timeout
            .checked_sub(started.elapsed())
            .unwrap_or(Duration::from_secs(1));
        if let Err(e) = driver.wait_for_prompt(Instant::now() + remaining) {
            driver.get_mut().hangup();
            return Err(CaptureError::connect(
                ConnectFailure::Timeout,
                target.endpoint(),
                format!("no CLI prompt after login: {e}"),
            ));
        }

        debug!(endpoint = %target.endpoint(), prompt = ?driver.prompt(), "SSH session ready");
        Ok(Box::new(PromptSession::new(driver, target.command_timeout)))
    }
}
