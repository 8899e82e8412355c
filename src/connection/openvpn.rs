//! OpenVPN process backend
//!
//! Spawns the `openvpn` binary with the management interface in client mode:
//! we listen on an ephemeral loopback port and openvpn connects to it. Every
//! `>` line from the management channel is parsed into a
//! [`ManagementMessage`] and mapped onto [`ConnectionEvent`]s.
//!
//! | Management line | Event |
//! |-----------------|-------|
//! | `>PASSWORD:Need 'Auth' ...` | answered, or `RequestUsername` |
//! | `>PASSWORD:Need 'Private Key' ...` | `RequestPrivKeyPassword` |
//! | `>PASSWORD:Verification Failed: 'Auth'` | `Error(AuthError)` |
//! | `>STATE:...,CONNECTED,...` | `Connected` |
//! | `>STATE:...,RECONNECTING,...` | `Reconnecting` |
//! | `>BYTECOUNT:in,out` | `StatisticsUpdated` |

use super::{
    ConnectParams, Connection, ConnectionError, ConnectionEvent, ConnectionFactory, EventSink,
};
use crate::types::{AdapterInfo, ConnectError, ConnectionType, ProxyKind, ProxySettings};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const MANAGEMENT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ManagementError {
    #[error("Malformed management line: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
enum SessionError {
    #[error("Management I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("openvpn did not open the management channel")]
    ManagementTimeout,
    #[error("openvpn exited early with {0:?}")]
    Exited(Option<i32>),
}

/// A parsed real-time notification from the management channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementMessage {
    NeedAuth,
    NeedPrivateKey,
    AuthFailed,
    PrivateKeyFailed,
    State {
        name: String,
        local_ip: Option<IpAddr>,
        remote_ip: Option<IpAddr>,
    },
    ByteCount {
        bytes_in: u64,
        bytes_out: u64,
    },
    DeviceOpened(String),
    PushedDns(Vec<IpAddr>),
    Hold,
    Fatal(String),
    Other,
}

impl FromStr for ManagementMessage {
    type Err = ManagementError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end();
        let Some((kind, body)) = line.strip_prefix('>').and_then(|l| l.split_once(':')) else {
            return Ok(ManagementMessage::Other);
        };

        match kind {
            "PASSWORD" => Ok(parse_password(body)),
            "STATE" => {
                // timestamp,name,description,local_ip,remote_ip,...
                let fields: Vec<&str> = body.split(',').collect();
                let name = fields
                    .get(1)
                    .ok_or_else(|| ManagementError::Malformed(line.to_string()))?;
                Ok(ManagementMessage::State {
                    name: name.to_string(),
                    local_ip: fields.get(3).and_then(|f| f.parse().ok()),
                    remote_ip: fields.get(4).and_then(|f| f.parse().ok()),
                })
            }
            "BYTECOUNT" => {
                let malformed = || ManagementError::Malformed(line.to_string());
                let (bytes_in, bytes_out) = body.split_once(',').ok_or_else(malformed)?;
                Ok(ManagementMessage::ByteCount {
                    bytes_in: bytes_in.trim().parse().map_err(|_| malformed())?,
                    bytes_out: bytes_out.trim().parse().map_err(|_| malformed())?,
                })
            }
            "LOG" => Ok(parse_log(body)),
            "HOLD" => Ok(ManagementMessage::Hold),
            "FATAL" => Ok(ManagementMessage::Fatal(body.to_string())),
            _ => Ok(ManagementMessage::Other),
        }
    }
}

fn parse_password(body: &str) -> ManagementMessage {
    if body.starts_with("Verification Failed") {
        if body.contains("'Private Key'") {
            return ManagementMessage::PrivateKeyFailed;
        }
        return ManagementMessage::AuthFailed;
    }
    if body.starts_with("Need 'Auth'") {
        return ManagementMessage::NeedAuth;
    }
    if body.starts_with("Need 'Private Key'") {
        return ManagementMessage::NeedPrivateKey;
    }
    ManagementMessage::Other
}

fn parse_log(body: &str) -> ManagementMessage {
    // timestamp,flags,message
    let Some(message) = body.splitn(3, ',').nth(2) else {
        return ManagementMessage::Other;
    };

    if let Some(device) = message
        .strip_prefix("TUN/TAP device ")
        .and_then(|rest| rest.strip_suffix(" opened"))
    {
        return ManagementMessage::DeviceOpened(device.to_string());
    }

    if message.contains("PUSH_REPLY") {
        let servers: Vec<IpAddr> = message
            .split(',')
            .filter_map(|option| option.trim().strip_prefix("dhcp-option DNS "))
            .filter_map(|ip| ip.trim_end_matches('\'').trim().parse().ok())
            .collect();
        if !servers.is_empty() {
            return ManagementMessage::PushedDns(servers);
        }
    }
    ManagementMessage::Other
}

/// Quote a value for a management `username`/`password` command
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

fn auth_reply(username: &str, password: &str) -> String {
    format!(
        "username \"Auth\" {}\npassword \"Auth\" {}\n",
        quote(username),
        quote(password)
    )
}

fn priv_key_reply(password: &str) -> String {
    format!("password \"Private Key\" {}\n", quote(password))
}

/// Config text handed to openvpn: the attempt's config plus proxy directives
pub fn build_config_text(config: &str, proxy: &ProxySettings) -> String {
    let mut text = config.trim_end().to_string();
    text.push('\n');
    if proxy.is_enabled() {
        let directive = match proxy.kind {
            ProxyKind::Http => "http-proxy",
            ProxyKind::Socks => "socks-proxy",
            ProxyKind::None => return text,
        };
        text.push_str(&format!("{} {} {}\n", directive, proxy.address, proxy.port));
    }
    text
}

fn write_config(text: &str, generation: u64) -> std::io::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!(
        "vpn-orchestrator-{}-{}.ovpn",
        std::process::id(),
        generation
    ));
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path)?;
    file.write_all(text.as_bytes())?;
    Ok(path)
}

enum ManagementCommand {
    Send(String),
    Stop,
}

/// Per-attempt state owned by the session task
struct Session {
    username: String,
    password: String,
    adapter: AdapterInfo,
}

impl Session {
    fn new(username: String, password: String) -> Self {
        Self {
            username,
            password,
            adapter: AdapterInfo::default(),
        }
    }

    /// Apply one management line; returns text to write back, if any
    fn handle_line(&mut self, line: &str, sink: &EventSink) -> Option<String> {
        let message = match line.parse::<ManagementMessage>() {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };

        match message {
            ManagementMessage::NeedAuth => {
                if !self.username.is_empty() && !self.password.is_empty() {
                    debug!("Answering auth request with stored credentials");
                    return Some(auth_reply(&self.username, &self.password));
                }
                if self.username.is_empty() {
                    sink.emit(ConnectionEvent::RequestUsername);
                } else {
                    sink.emit(ConnectionEvent::RequestPassword);
                }
            }
            ManagementMessage::NeedPrivateKey => sink.emit(ConnectionEvent::RequestPrivKeyPassword),
            ManagementMessage::AuthFailed => {
                self.password.clear();
                sink.emit(ConnectionEvent::Error(ConnectError::AuthError));
            }
            ManagementMessage::PrivateKeyFailed => {
                sink.emit(ConnectionEvent::Error(ConnectError::PrivKeyPasswordError))
            }
            ManagementMessage::State {
                name,
                local_ip,
                remote_ip,
            } => match name.as_str() {
                "CONNECTED" => {
                    self.adapter.adapter_ip = local_ip;
                    self.adapter.remote_ip = remote_ip;
                    info!("openvpn connected, local {:?} remote {:?}", local_ip, remote_ip);
                    sink.emit(ConnectionEvent::Connected(self.adapter.clone()));
                }
                "RECONNECTING" => sink.emit(ConnectionEvent::Reconnecting),
                other => debug!("openvpn state {}", other),
            },
            ManagementMessage::ByteCount {
                bytes_in,
                bytes_out,
            } => sink.emit(ConnectionEvent::StatisticsUpdated {
                bytes_in,
                bytes_out,
                is_total: true,
            }),
            ManagementMessage::DeviceOpened(device) => {
                self.adapter.adapter_name = device.clone();
                sink.emit(ConnectionEvent::InterfaceUpdated(device));
            }
            ManagementMessage::PushedDns(servers) => self.adapter.dns_servers = servers,
            ManagementMessage::Hold => return Some("hold release\n".to_string()),
            ManagementMessage::Fatal(message) => {
                error!("openvpn fatal: {}", message);
                let error = if message.contains("TUN/TAP") {
                    ConnectError::AdapterFatal
                } else {
                    ConnectError::DriverFailed(message)
                };
                sink.emit(ConnectionEvent::Error(error));
            }
            ManagementMessage::Other => {}
        }
        None
    }
}

pub struct OpenVpnFactory {
    binary: PathBuf,
}

impl OpenVpnFactory {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for OpenVpnFactory {
    fn default() -> Self {
        Self::new("openvpn")
    }
}

impl ConnectionFactory for OpenVpnFactory {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::OpenVpn
    }

    fn create(&self) -> Box<dyn Connection> {
        Box::new(OpenVpnConnection::new(self.binary.clone()))
    }
}

pub struct OpenVpnConnection {
    binary: PathBuf,
    commands: Option<mpsc::UnboundedSender<ManagementCommand>>,
    disconnected: Arc<AtomicBool>,
    username: String,
}

impl OpenVpnConnection {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            commands: None,
            disconnected: Arc::new(AtomicBool::new(true)),
            username: String::new(),
        }
    }

    fn send(&self, text: String) {
        match &self.commands {
            Some(commands) => {
                if commands.send(ManagementCommand::Send(text)).is_err() {
                    debug!("openvpn session already finished");
                }
            }
            None => debug!("openvpn not started"),
        }
    }

    fn spawn_process(&self, config_path: &Path, port: u16) -> std::io::Result<Child> {
        Command::new(&self.binary)
            .arg("--config")
            .arg(config_path)
            .args(["--management", "127.0.0.1"])
            .arg(port.to_string())
            .args([
                "--management-client",
                "--management-query-passwords",
                "--management-hold",
                "--verb",
                "3",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

impl Connection for OpenVpnConnection {
    fn start_connect(
        &mut self,
        params: ConnectParams,
        sink: EventSink,
    ) -> Result<(), ConnectionError> {
        if self.commands.is_some() {
            return Err(ConnectionError::AlreadyRunning);
        }
        if params.config.trim().is_empty() {
            return Err(ConnectionError::UnsupportedConfig(
                "empty OpenVPN config".to_string(),
            ));
        }

        let config_path = write_config(
            &build_config_text(&params.config, &params.proxy),
            sink.generation(),
        )?;
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();

        let child = match self.spawn_process(&config_path, port) {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&config_path);
                return Err(e.into());
            }
        };
        info!(
            "Started openvpn (pid {:?}) for {}, management port {}",
            child.id(),
            params.hostname,
            port
        );

        let (tx, rx) = mpsc::unbounded_channel();
        self.commands = Some(tx);
        self.username = params.username.clone();
        self.disconnected.store(false, Ordering::SeqCst);

        let session = Session::new(params.username, params.password);
        tokio::spawn(run_session(
            child,
            listener,
            rx,
            sink,
            session,
            config_path,
            self.disconnected.clone(),
        ));
        Ok(())
    }

    fn start_disconnect(&mut self) {
        if let Some(commands) = &self.commands {
            debug!("Stopping openvpn");
            let _ = commands.send(ManagementCommand::Stop);
        }
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::OpenVpn
    }

    fn continue_with_username_and_password(&mut self, username: &str, password: &str) {
        self.username = username.to_string();
        self.send(auth_reply(username, password));
    }

    fn continue_with_password(&mut self, password: &str) {
        self.send(auth_reply(&self.username, password));
    }

    fn continue_with_priv_key_password(&mut self, password: &str) {
        self.send(priv_key_reply(password));
    }
}

async fn run_session(
    mut child: Child,
    listener: std::net::TcpListener,
    mut commands: mpsc::UnboundedReceiver<ManagementCommand>,
    sink: EventSink,
    mut session: Session,
    config_path: PathBuf,
    disconnected: Arc<AtomicBool>,
) {
    if let Err(e) = drive(&mut child, listener, &mut commands, &sink, &mut session).await {
        warn!("openvpn session ended: {}", e);
        sink.emit(ConnectionEvent::Error(ConnectError::DriverFailed(e.to_string())));
    }

    match timeout(EXIT_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!("openvpn exited: {}", status),
        _ => {
            warn!("openvpn did not exit, killing it");
            if let Err(e) = child.kill().await {
                error!("Failed to kill openvpn: {}", e);
            }
        }
    }

    if let Err(e) = std::fs::remove_file(&config_path) {
        debug!("Failed to remove {}: {}", config_path.display(), e);
    }
    disconnected.store(true, Ordering::SeqCst);
    sink.emit(ConnectionEvent::Disconnected);
}

async fn drive(
    child: &mut Child,
    listener: std::net::TcpListener,
    commands: &mut mpsc::UnboundedReceiver<ManagementCommand>,
    sink: &EventSink,
    session: &mut Session,
) -> Result<(), SessionError> {
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;

    let accept = timeout(MANAGEMENT_ACCEPT_TIMEOUT, listener.accept());
    tokio::pin!(accept);
    let stream = loop {
        tokio::select! {
            accepted = &mut accept => match accepted {
                Ok(Ok((stream, _))) => break stream,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(SessionError::ManagementTimeout),
            },
            status = child.wait() => {
                return Err(SessionError::Exited(status.ok().and_then(|s| s.code())));
            }
            command = commands.recv() => match command {
                Some(ManagementCommand::Send(_)) => debug!("Management not connected, dropping command"),
                Some(ManagementCommand::Stop) | None => {
                    child.start_kill()?;
                    return Ok(());
                }
            },
        }
    };

    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    write
        .write_all(b"log on\nstate on\nbytecount 1\nhold release\n")
        .await?;

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Some(reply) = session.handle_line(&line, sink) {
                        write.write_all(reply.as_bytes()).await?;
                    }
                }
                None => return Ok(()),
            },
            command = commands.recv() => match command {
                Some(ManagementCommand::Send(text)) => write.write_all(text.as_bytes()).await?,
                Some(ManagementCommand::Stop) | None => {
                    let _ = write.write_all(b"signal SIGTERM\n").await;
                    return Ok(());
                }
            },
            status = child.wait() => {
                debug!("openvpn exited: {:?}", status);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{EventSender, Slot};
    use std::sync::Mutex;

    fn recording_sink() -> (EventSink, Arc<Mutex<Vec<ConnectionEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        let sender: EventSender = Arc::new(move |_, _, event| log.lock().unwrap().push(event));
        (EventSink::new(Slot::Primary, 1, sender), events)
    }

    #[test]
    fn test_parse_password_lines() {
        let parse = |l: &str| l.parse::<ManagementMessage>().unwrap();
        assert_eq!(
            parse(">PASSWORD:Need 'Auth' username/password"),
            ManagementMessage::NeedAuth
        );
        assert_eq!(
            parse(">PASSWORD:Need 'Private Key' password"),
            ManagementMessage::NeedPrivateKey
        );
        assert_eq!(
            parse(">PASSWORD:Verification Failed: 'Auth'"),
            ManagementMessage::AuthFailed
        );
        assert_eq!(
            parse(">PASSWORD:Verification Failed: 'Private Key'"),
            ManagementMessage::PrivateKeyFailed
        );
    }

    #[test]
    fn test_parse_state_and_bytecount() {
        let state: ManagementMessage = ">STATE:1700000000,CONNECTED,SUCCESS,10.8.0.2,198.51.100.1,1194,,"
            .parse()
            .unwrap();
        assert_eq!(
            state,
            ManagementMessage::State {
                name: "CONNECTED".to_string(),
                local_ip: Some("10.8.0.2".parse().unwrap()),
                remote_ip: Some("198.51.100.1".parse().unwrap()),
            }
        );

        let bytes: ManagementMessage = ">BYTECOUNT:1024,2048".parse().unwrap();
        assert_eq!(
            bytes,
            ManagementMessage::ByteCount {
                bytes_in: 1024,
                bytes_out: 2048
            }
        );
        assert!(">BYTECOUNT:lots".parse::<ManagementMessage>().is_err());
    }

    #[test]
    fn test_parse_log_lines() {
        let device: ManagementMessage = ">LOG:1700000000,I,TUN/TAP device tun3 opened"
            .parse()
            .unwrap();
        assert_eq!(device, ManagementMessage::DeviceOpened("tun3".to_string()));

        let push: ManagementMessage = ">LOG:1700000000,I,PUSH: Received control message: 'PUSH_REPLY,route-gateway 10.8.0.1,dhcp-option DNS 10.8.0.1,dhcp-option DNS 10.8.0.2'"
            .parse()
            .unwrap();
        assert_eq!(
            push,
            ManagementMessage::PushedDns(vec![
                "10.8.0.1".parse().unwrap(),
                "10.8.0.2".parse().unwrap()
            ])
        );

        assert_eq!(
            "plain output".parse::<ManagementMessage>().unwrap(),
            ManagementMessage::Other
        );
    }

    #[test]
    fn test_auth_reply_escapes_quotes() {
        assert_eq!(
            auth_reply("alice", r#"p"w\d"#),
            "username \"Auth\" \"alice\"\npassword \"Auth\" \"p\\\"w\\\\d\"\n"
        );
    }

    #[test]
    fn test_config_text_with_proxy() {
        let proxy = ProxySettings {
            kind: ProxyKind::Socks,
            address: "192.0.2.5".to_string(),
            port: 1080,
            ..ProxySettings::default()
        };
        let text = build_config_text("client\nremote 198.51.100.1 1194\n\n", &proxy);
        assert_eq!(
            text,
            "client\nremote 198.51.100.1 1194\nsocks-proxy 192.0.2.5 1080\n"
        );
        assert_eq!(
            build_config_text("client", &ProxySettings::default()),
            "client\n"
        );
    }

    #[test]
    fn test_session_answers_auth_with_server_credentials() {
        let (sink, events) = recording_sink();
        let mut session = Session::new("ovpn-user".to_string(), "ovpn-pass".to_string());

        let reply = session.handle_line(">PASSWORD:Need 'Auth' username/password", &sink);
        assert_eq!(reply, Some(auth_reply("ovpn-user", "ovpn-pass")));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_session_requests_missing_credentials() {
        let (sink, events) = recording_sink();
        let mut session = Session::new(String::new(), String::new());

        assert_eq!(
            session.handle_line(">PASSWORD:Need 'Auth' username/password", &sink),
            None
        );
        session.handle_line(">PASSWORD:Verification Failed: 'Auth'", &sink);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ConnectionEvent::RequestUsername,
                ConnectionEvent::Error(ConnectError::AuthError)
            ]
        );
    }

    #[test]
    fn test_session_reports_connected_adapter() {
        let (sink, events) = recording_sink();
        let mut session = Session::new("u".to_string(), "p".to_string());

        session.handle_line(">LOG:1700000000,I,TUN/TAP device tun0 opened", &sink);
        session.handle_line(
            ">LOG:1700000000,I,PUSH: Received control message: 'PUSH_REPLY,dhcp-option DNS 10.8.0.1'",
            &sink,
        );
        assert_eq!(
            session.handle_line(">HOLD:Waiting for hold release:0", &sink),
            Some("hold release\n".to_string())
        );
        session.handle_line(
            ">STATE:1700000000,CONNECTED,SUCCESS,10.8.0.2,198.51.100.1,1194,,",
            &sink,
        );

        let events = events.lock().unwrap();
        assert_eq!(events[0], ConnectionEvent::InterfaceUpdated("tun0".to_string()));
        match &events[1] {
            ConnectionEvent::Connected(adapter) => {
                assert_eq!(adapter.adapter_name, "tun0");
                assert_eq!(adapter.dns_servers, vec!["10.8.0.1".parse::<IpAddr>().unwrap()]);
                assert_eq!(adapter.remote_ip, Some("198.51.100.1".parse().unwrap()));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_fatal_tun_error() {
        let (sink, events) = recording_sink();
        let mut session = Session::new(String::new(), String::new());
        session.handle_line(">FATAL:Cannot open TUN/TAP dev /dev/net/tun", &sink);
        assert_eq!(
            *events.lock().unwrap(),
            vec![ConnectionEvent::Error(ConnectError::AdapterFatal)]
        );
    }

    #[test]
    fn test_connection_reports_disconnected_before_start() {
        let connection = OpenVpnConnection::new(PathBuf::from("openvpn"));
        assert!(connection.is_disconnected());
        assert_eq!(connection.connection_type(), ConnectionType::OpenVpn);
    }
}
