//! Write-only FTP listener for relay uploads
//!
//! Authenticated clients may change directory, create directories and
//! upload files below the ingestion root. Reading, listing, deleting and
//! renaming are refused. Only passive data connections are offered.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::{IngestionCoordinator, ListenerHandle};
use crate::config::RelayConfig;

const BANNER: &str = "cfgvault ingestion server ready";
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const DATA_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_COMMAND_LINE: usize = 4096;

/// Commands that would expose or alter stored uploads
const REFUSED: &[&str] = &[
    "RETR", "LIST", "NLST", "DELE", "RNFR", "RNTO", "APPE", "MLSD", "MLST", "SIZE", "RMD",
    "STOU", "MDTM", "SITE",
];

/// Listener settings
#[derive(Debug, Clone)]
pub struct FtpServerConfig {
    pub bind: SocketAddr,
    pub user: String,
    pub password: String,
    /// Inclusive passive port range; `(0, 0)` lets the OS pick
    pub passive_ports: (u16, u16),
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
}

impl FtpServerConfig {
    pub fn from_relay(relay: &RelayConfig, bind_host: IpAddr) -> Self {
        Self {
            bind: SocketAddr::new(bind_host, relay.ftp_port),
            user: relay.ftp_user.clone(),
            password: relay.ftp_password.clone(),
            passive_ports: relay.passive_ports,
            max_connections: relay.max_connections,
            max_connections_per_ip: relay.max_connections_per_ip,
        }
    }
}

#[derive(Debug, Default)]
struct ConnectionCounts {
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
}

/// Releases a connection slot on drop
struct ConnectionSlot {
    counts: Arc<Mutex<ConnectionCounts>>,
    ip: IpAddr,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.total = counts.total.saturating_sub(1);
        if let Some(n) = counts.per_ip.get_mut(&self.ip) {
            *n -= 1;
            if *n == 0 {
                counts.per_ip.remove(&self.ip);
            }
        }
    }
}

pub struct FtpIngestionServer {
    config: FtpServerConfig,
    coordinator: Arc<IngestionCoordinator>,
    handle: ListenerHandle,
    counts: Arc<Mutex<ConnectionCounts>>,
}

impl FtpIngestionServer {
    pub fn new(config: FtpServerConfig, coordinator: Arc<IngestionCoordinator>) -> Self {
        Self {
            config,
            coordinator,
            handle: ListenerHandle::new(),
            counts: Arc::default(),
        }
    }

    /// Flag that is set while the listener accepts connections
    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        if self.config.password.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "FTP password is not configured",
            ));
        }
        tokio::fs::create_dir_all(self.coordinator.root()).await?;
        TcpListener::bind(self.config.bind).await
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            address = %listener.local_addr()?,
            root = %self.coordinator.root().display(),
            "FTP ingestion listener started"
        );
        self.handle.set_running(true);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept FTP connection");
                        continue;
                    }
                },
            };

            let Some(slot) = self.claim_slot(peer.ip()) else {
                warn!(peer = %peer, "FTP connection limit reached");
                let mut stream = stream;
                let _ = stream.write_all(b"421 Too many connections\r\n").await;
                continue;
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let _slot = slot;
                if let Err(e) = server.handle_connection(stream, peer).await {
                    debug!(peer = %peer, error = %e, "FTP connection ended with error");
                }
            });
        }

        self.handle.set_running(false);
        info!("FTP ingestion listener stopped");
        Ok(())
    }

    fn claim_slot(&self, ip: IpAddr) -> Option<ConnectionSlot> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let from_ip = counts.per_ip.get(&ip).copied().unwrap_or(0);
        if counts.total >= self.config.max_connections
            || from_ip >= self.config.max_connections_per_ip
        {
            return None;
        }
        counts.total += 1;
        counts.per_ip.insert(ip, from_ip + 1);
        Some(ConnectionSlot {
            counts: Arc::clone(&self.counts),
            ip,
        })
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let local_ip = stream.local_addr()?.ip();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut session = FtpSession::default();

        reply(&mut writer, 220, BANNER).await?;

        let mut raw = Vec::new();
        loop {
            raw.clear();
            let mut limited = (&mut reader).take(MAX_COMMAND_LINE as u64 + 1);
            let read = tokio::time::timeout(IDLE_TIMEOUT, limited.read_until(b'\n', &mut raw)).await;
            match read {
                Err(_) => {
                    reply(&mut writer, 421, "Idle timeout").await?;
                    return Ok(());
                }
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) if n > MAX_COMMAND_LINE => {
                    // The rest of the line is still unread; drop the connection.
                    warn!(peer = %peer, "FTP command line too long");
                    reply(&mut writer, 500, "Command line too long").await?;
                    return Ok(());
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
            }

            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            let (verb, arg) = match line.split_once(' ') {
                Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
                None => (line.trim().to_ascii_uppercase(), ""),
            };

            if verb == "PASS" {
                debug!(peer = %peer, "FTP command PASS ****");
            } else {
                debug!(peer = %peer, command = %line, "FTP command");
            }

            let keep_going = self
                .dispatch(&mut session, &mut writer, local_ip, peer, &verb, arg)
                .await?;
            if !keep_going {
                return Ok(());
            }
        }
    }

    async fn dispatch(
        &self,
        session: &mut FtpSession,
        w: &mut OwnedWriteHalf,
        local_ip: IpAddr,
        peer: SocketAddr,
        verb: &str,
        arg: &str,
    ) -> io::Result<bool> {
        match verb {
            "USER" => {
                session.user = Some(arg.to_string());
                session.authenticated = false;
                reply(w, 331, "Password required").await?;
            }
            "PASS" => {
                let accepted = !self.config.password.is_empty()
                    && session.user.as_deref() == Some(self.config.user.as_str())
                    && arg == self.config.password;
                if accepted {
                    session.authenticated = true;
                    info!(peer = %peer, "FTP login accepted");
                    reply(w, 230, "Login successful").await?;
                } else {
                    warn!(peer = %peer, "FTP login rejected");
                    reply(w, 530, "Login incorrect").await?;
                }
            }
            "QUIT" => {
                reply(w, 221, "Goodbye").await?;
                return Ok(false);
            }
            "NOOP" => reply(w, 200, "OK").await?,
            "SYST" => reply(w, 215, "UNIX Type: L8").await?,
            "FEAT" => {
                w.write_all(b"211-Features:\r\n EPSV\r\n PASV\r\n UTF8\r\n211 End\r\n")
                    .await?
            }
            "OPTS" => reply(w, 200, "OK").await?,
            _ if !session.authenticated => reply(w, 530, "Please login with USER and PASS").await?,
            "TYPE" => reply(w, 200, "Type set").await?,
            "MODE" | "STRU" => reply(w, 200, "OK").await?,
            "PWD" | "XPWD" => {
                let text = format!("\"{}\" is the current directory", session.display_cwd());
                reply(w, 257, &text).await?;
            }
            "CWD" | "XCWD" => self.change_dir(session, w, arg).await?,
            "CDUP" | "XCUP" => self.change_dir(session, w, "..").await?,
            "MKD" | "XMKD" => self.make_dir(session, w, arg).await?,
            "PASV" => self.open_passive(session, w, local_ip, false).await?,
            "EPSV" => self.open_passive(session, w, local_ip, true).await?,
            "PORT" | "EPRT" => reply(w, 502, "Active mode is not supported").await?,
            "STOR" => self.store(session, w, peer, arg).await?,
            _ if REFUSED.contains(&verb) => reply(w, 550, "Permission denied").await?,
            _ => reply(w, 502, "Command not implemented").await?,
        }
        Ok(true)
    }

    fn physical(&self, components: &[String]) -> PathBuf {
        components
            .iter()
            .fold(self.coordinator.root().to_path_buf(), |path, part| path.join(part))
    }

    async fn change_dir(
        &self,
        session: &mut FtpSession,
        w: &mut OwnedWriteHalf,
        arg: &str,
    ) -> io::Result<()> {
        let Some(target) = resolve_virtual(&session.cwd, arg) else {
            return reply(w, 550, "No such directory").await;
        };
        match tokio::fs::metadata(self.physical(&target)).await {
            Ok(meta) if meta.is_dir() => {
                session.cwd = target;
                reply(w, 250, "Directory changed").await
            }
            _ => reply(w, 550, "No such directory").await,
        }
    }

    async fn make_dir(
        &self,
        session: &mut FtpSession,
        w: &mut OwnedWriteHalf,
        arg: &str,
    ) -> io::Result<()> {
        let target = match resolve_virtual(&session.cwd, arg) {
            Some(target) if !target.is_empty() => target,
            _ => return reply(w, 550, "Invalid directory name").await,
        };
        match tokio::fs::create_dir_all(self.physical(&target)).await {
            Ok(()) => {
                let text = format!("\"/{}\" created", target.join("/"));
                reply(w, 257, &text).await
            }
            Err(e) => {
                warn!(error = %e, "FTP MKD failed");
                reply(w, 550, "Cannot create directory").await
            }
        }
    }

    async fn open_passive(
        &self,
        session: &mut FtpSession,
        w: &mut OwnedWriteHalf,
        local_ip: IpAddr,
        extended: bool,
    ) -> io::Result<()> {
        let ip = match local_ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(local_ip),
            v4 => v4,
        };
        if !extended && ip.is_ipv6() {
            return reply(w, 522, "Use EPSV for IPv6").await;
        }

        let Some(listener) = bind_passive(local_ip, self.config.passive_ports).await else {
            return reply(w, 425, "No passive port available").await;
        };
        let port = listener.local_addr()?.port();
        session.passive = Some(listener);

        if extended {
            let text = format!("Entering Extended Passive Mode (|||{port}|)");
            reply(w, 229, &text).await
        } else {
            let octets = match ip {
                IpAddr::V4(v4) => v4.octets(),
                IpAddr::V6(_) => return reply(w, 522, "Use EPSV for IPv6").await,
            };
            let text = format!(
                "Entering Passive Mode ({},{},{},{},{},{})",
                octets[0],
                octets[1],
                octets[2],
                octets[3],
                port >> 8,
                port & 0xff
            );
            reply(w, 227, &text).await
        }
    }

    async fn store(
        &self,
        session: &mut FtpSession,
        w: &mut OwnedWriteHalf,
        peer: SocketAddr,
        arg: &str,
    ) -> io::Result<()> {
        let target = match resolve_virtual(&session.cwd, arg) {
            Some(target) if !target.is_empty() => target,
            _ => return reply(w, 553, "Invalid file name").await,
        };
        let Some(passive) = session.passive.take() else {
            return reply(w, 425, "Use PASV or EPSV first").await;
        };
        let path = self.physical(&target);
        match path.parent().map(std::path::Path::is_dir) {
            Some(true) => {}
            _ => return reply(w, 553, "Directory does not exist").await,
        }

        let mut file = match tokio::fs::File::create(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "FTP upload could not be opened");
                return reply(w, 553, "Cannot create file").await;
            }
        };

        reply(w, 150, "Ready to receive data").await?;

        let transfer = async {
            let (mut data, _) = tokio::time::timeout(DATA_ACCEPT_TIMEOUT, passive.accept())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no data connection"))??;
            let received = tokio::io::copy(&mut data, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, io::Error>(received)
        };

        match transfer.await {
            Ok(received) => {
                info!(peer = %peer, path = %path.display(), bytes = received, "FTP upload completed");
                if let Err(e) = self.coordinator.on_file_received(&path).await {
                    warn!(path = %path.display(), error = %e, "Upload could not be ingested");
                }
                reply(w, 226, "Transfer complete").await
            }
            Err(e) => {
                warn!(peer = %peer, path = %path.display(), error = %e, "FTP upload aborted");
                self.coordinator.on_incomplete_file_received(&path).await;
                reply(w, 426, "Transfer aborted").await
            }
        }
    }
}

#[derive(Default)]
struct FtpSession {
    user: Option<String>,
    authenticated: bool,
    /// Current directory as components below the root
    cwd: Vec<String>,
    passive: Option<TcpListener>,
}

impl FtpSession {
    fn display_cwd(&self) -> String {
        format!("/{}", self.cwd.join("/"))
    }
}

async fn reply(w: &mut OwnedWriteHalf, code: u16, text: &str) -> io::Result<()> {
    w.write_all(format!("{code} {text}\r\n").as_bytes()).await
}

async fn bind_passive(ip: IpAddr, (first, last): (u16, u16)) -> Option<TcpListener> {
    if first == 0 {
        return TcpListener::bind((ip, 0)).await.ok();
    }
    for port in first..=last {
        if let Ok(listener) = TcpListener::bind((ip, port)).await {
            return Some(listener);
        }
    }
    None
}

/// Resolve an FTP path argument against `cwd` inside the jail.
///
/// Returns `None` when the path would climb above the root or contains
/// characters that are never valid in an upload path.
pub(crate) fn resolve_virtual(cwd: &[String], arg: &str) -> Option<Vec<String>> {
    if arg.contains(['\\', '\0']) {
        return None;
    }
    let mut parts: Vec<String> = if arg.starts_with('/') {
        Vec::new()
    } else {
        cwd.to_vec()
    };
    for part in arg.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            name => parts.push(name.to_string()),
        }
    }
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::RelayConsumer;
    use crate::device::{Credentials, DeviceDescriptor, DeviceId, StaticDirectory};
    use crate::ingest::RelayMailbox;
    use crate::storage::{ArtifactFilter, ArtifactStore, LocalArtifactStore};
    use crate::vendor::{Transport, Vendor};
    use std::net::Ipv4Addr;
    use tempfile::TempDir;
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::sync::oneshot;

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (r, w) = stream.into_split();
            Self {
                reader: BufReader::new(r),
                writer: w,
            }
        }

        /// Read one (possibly multi-line) reply, returning its code and last line
        async fn read_reply(&mut self) -> (u16, String) {
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                let line = line.trim_end().to_string();
                if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                    if let Ok(code) = line[..3].parse() {
                        return (code, line);
                    }
                }
                assert!(!line.is_empty(), "connection closed while reading reply");
            }
        }

        async fn cmd(&mut self, line: &str) -> (u16, String) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
            self.read_reply().await
        }

        async fn login(&mut self) {
            assert_eq!(self.read_reply().await.0, 220);
            assert_eq!(self.cmd("USER relay").await.0, 331);
            assert_eq!(self.cmd("PASS s3cret").await.0, 230);
        }

        async fn epsv_port(&mut self) -> u16 {
            let (code, text) = self.cmd("EPSV").await;
            assert_eq!(code, 229);
            let inner = text.split("|||").nth(1).unwrap();
            inner.trim_end_matches(|c| c == '|' || c == ')').parse().unwrap()
        }
    }

    struct Running {
        _dirs: (TempDir, TempDir),
        inbox: PathBuf,
        store: Arc<LocalArtifactStore>,
        addr: SocketAddr,
        handle: ListenerHandle,
        stop: Option<oneshot::Sender<()>>,
    }

    async fn start(per_ip: usize) -> Running {
        let inbox = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        let store = Arc::new(LocalArtifactStore::open(storage.path()).unwrap());
        let directory = Arc::new(StaticDirectory::new([DeviceDescriptor {
            id: DeviceId::new("olt1").unwrap(),
            name: "OLT 1".to_string(),
            address: "192.0.2.10".to_string(),
            port: None,
            transport: Transport::Telnet,
            vendor: Vendor::Zte,
            credentials: Credentials {
                username: "u".to_string(),
                password: "p".to_string(),
                enable_secret: None,
            },
            active: true,
        }]));
        let coordinator = Arc::new(IngestionCoordinator::new(
            inbox.path(),
            RelayConsumer::Coordinator,
            store.clone(),
            directory,
            RelayMailbox::new(),
            Arc::new(MemoryAuditSink::new()),
        ));
        let config = FtpServerConfig {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            user: "relay".to_string(),
            password: "s3cret".to_string(),
            passive_ports: (0, 0),
            max_connections: 10,
            max_connections_per_ip: per_ip,
        };
        let server = Arc::new(FtpIngestionServer::new(config, coordinator));
        let handle = server.handle();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(server.serve(listener, async move {
            let _ = stopped.await;
        }));
        while !handle.running() {
            tokio::task::yield_now().await;
        }

        Running {
            inbox: inbox.path().to_path_buf(),
            _dirs: (inbox, storage),
            store,
            addr,
            handle,
            stop: Some(stop),
        }
    }

    #[test]
    fn test_resolve_virtual_stays_in_jail() {
        let cwd = vec!["zte".to_string()];
        assert_eq!(
            resolve_virtual(&cwd, "olt1/startrun.dat").unwrap(),
            vec!["zte", "olt1", "startrun.dat"]
        );
        assert_eq!(resolve_virtual(&cwd, "/zte/./olt1/").unwrap(), vec!["zte", "olt1"]);
        assert_eq!(resolve_virtual(&cwd, "..").unwrap(), Vec::<String>::new());
        assert!(resolve_virtual(&cwd, "../..").is_none());
        assert!(resolve_virtual(&cwd, "/../etc").is_none());
        assert!(resolve_virtual(&cwd, "a\\b").is_none());
    }

    #[tokio::test]
    async fn test_upload_is_ingested() {
        let running = start(3).await;
        let mut client = Client::connect(running.addr).await;
        client.login().await;

        assert_eq!(client.cmd("TYPE I").await.0, 200);
        assert_eq!(client.cmd("MKD zte/olt1").await.0, 257);
        assert_eq!(client.cmd("CWD zte/olt1/").await.0, 250);
        let (code, text) = client.cmd("PWD").await;
        assert_eq!(code, 257);
        assert!(text.contains("\"/zte/olt1\""));

        let port = client.epsv_port().await;
        client
            .writer
            .write_all(b"STOR startrun.dat\r\n")
            .await
            .unwrap();
        let mut data = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        assert_eq!(client.read_reply().await.0, 150);
        data.write_all(b"binary zte config").await.unwrap();
        drop(data);
        assert_eq!(client.read_reply().await.0, 226);

        let listed = running.store.list(&ArtifactFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            running.store.read(&listed[0].path).unwrap(),
            b"binary zte config".to_vec()
        );
        assert!(!running.inbox.join("zte/olt1/startrun.dat").exists());

        assert_eq!(client.cmd("QUIT").await.0, 221);
    }

    #[tokio::test]
    async fn test_oversized_command_line_closes_connection() {
        let running = start(3).await;
        let mut client = Client::connect(running.addr).await;
        assert_eq!(client.read_reply().await.0, 220);

        let flood = vec![b'A'; MAX_COMMAND_LINE + 1];
        client.writer.write_all(&flood).await.unwrap();
        let (code, text) = client.read_reply().await;
        assert_eq!(code, 500);
        assert!(text.contains("too long"));

        let mut rest = Vec::new();
        client.reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let mut next = Client::connect(running.addr).await;
        next.login().await;
        assert_eq!(next.cmd("NOOP").await.0, 200);
    }

    #[tokio::test]
    async fn test_login_required_and_bad_password() {
        let running = start(3).await;
        let mut client = Client::connect(running.addr).await;
        assert_eq!(client.read_reply().await.0, 220);

        assert_eq!(client.cmd("PWD").await.0, 530);
        assert_eq!(client.cmd("USER relay").await.0, 331);
        assert_eq!(client.cmd("PASS wrong").await.0, 530);
        assert_eq!(client.cmd("STOR x").await.0, 530);
        assert_eq!(client.cmd("SYST").await.0, 215);
    }

    #[tokio::test]
    async fn test_read_commands_are_refused() {
        let running = start(3).await;
        std::fs::create_dir_all(running.inbox.join("zte")).unwrap();
        std::fs::write(running.inbox.join("zte/secret.txt"), b"x").unwrap();

        let mut client = Client::connect(running.addr).await;
        client.login().await;
        let refused = [
            "RETR zte/secret.txt",
            "LIST",
            "NLST",
            "DELE zte/secret.txt",
            "RNFR zte/secret.txt",
            "SIZE zte/secret.txt",
        ];
        for command in refused {
            assert_eq!(client.cmd(command).await.0, 550, "{command}");
        }
        assert_eq!(client.cmd("PORT 127,0,0,1,4,1").await.0, 502);
        assert_eq!(client.cmd("CWD ../..").await.0, 550);
        assert_eq!(client.cmd("CWD missing").await.0, 550);
        assert!(running.inbox.join("zte/secret.txt").exists());
    }

    #[tokio::test]
    async fn test_store_needs_directory_and_passive_port() {
        let running = start(3).await;
        std::fs::create_dir_all(running.inbox.join("zte/olt1")).unwrap();
        let mut client = Client::connect(running.addr).await;
        client.login().await;

        let _ = client.epsv_port().await;
        assert_eq!(client.cmd("STOR nowhere/startrun.dat").await.0, 553);
        // The passive port is single use.
        assert_eq!(client.cmd("STOR zte/olt1/startrun.dat").await.0, 425);
        assert!(!running.inbox.join("zte/olt1/startrun.dat").exists());
    }

    #[tokio::test]
    async fn test_per_ip_connection_cap() {
        let running = start(1).await;
        let mut first = Client::connect(running.addr).await;
        assert_eq!(first.read_reply().await.0, 220);

        let mut second = Client::connect(running.addr).await;
        let mut buf = Vec::new();
        second.reader.read_to_end(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf).starts_with("421"));
    }

    #[tokio::test]
    async fn test_shutdown_clears_running_flag() {
        let mut running = start(3).await;
        assert!(running.handle.running());
        running.stop.take().unwrap().send(()).unwrap();
        for _ in 0..100 {
            if !running.handle.running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!running.handle.running());
    }
}
