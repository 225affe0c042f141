//! A scripted bridge server on a loopback socket, speaking just enough of the host and sync
//! protocols for unit tests.

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{Arc, Mutex},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use crate::{adb::AdbServer, models::Settings};

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub version: u32,
    /// `serial  state  attrs` lines answered to `host:devices-l`.
    pub devices: Vec<String>,
    /// Payloads sent one by one on `host:track-devices`.
    pub track_snapshots: Vec<String>,
    pub keep_tracking_open: bool,
    /// Output keyed by service request, e.g. `shell:getprop ro.build.version.sdk`. A key also
    /// answers requests it is a prefix of.
    pub shell: HashMap<String, Vec<u8>>,
    /// Services that keep the socket open after their output until the client hangs up.
    pub hold_open: HashSet<String>,
    /// Listed serials whose transport handshake fails.
    pub unreachable: HashSet<String>,
    pub files: HashMap<String, Vec<u8>>,
    /// Size of the `DATA` packets sent on `RECV`.
    pub recv_chunk: usize,
    pub requests: Vec<String>,
    pub killed: bool,
}

impl FakeState {
    pub fn with_device(mut self, line: &str) -> Self {
        self.devices.push(line.to_string());
        self
    }

    pub fn with_shell(mut self, service: &str, output: impl AsRef<[u8]>) -> Self {
        self.shell.insert(service.to_string(), output.as_ref().to_vec());
        self
    }

    /// Exact match first, then the longest registered prefix of `service`.
    fn shell_output(&self, service: &str) -> Vec<u8> {
        if let Some(output) = self.shell.get(service) {
            return output.clone();
        }
        self.shell
            .iter()
            .filter(|(key, _)| service.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, output)| output.clone())
            .unwrap_or_default()
    }
}

pub(crate) struct FakeServer {
    port: u16,
    state: Arc<Mutex<FakeState>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(mut state: FakeState) -> Self {
        if state.version == 0 {
            state.version = 41;
        }
        if state.recv_chunk == 0 {
            state.recv_chunk = 64 * 1024;
        }
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(state));
        let task = tokio::spawn({
            let state = state.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let state = state.clone();
                    tokio::spawn(async move {
                        let _ = handle(stream, state).await;
                    });
                }
            }
        });
        Self { port, state, task }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            server_host: "127.0.0.1".into(),
            server_port: self.port,
            adb_path: "/nonexistent/adb".into(),
            ..Default::default()
        }
    }

    pub fn server(&self) -> AdbServer {
        AdbServer::new(&self.settings())
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn put_file(&self, path: &str, data: Vec<u8>) {
        self.state.lock().unwrap().files.insert(path.to_string(), data);
    }

    pub fn remove_file(&self, path: &str) {
        self.state.lock().unwrap().files.remove(path);
    }

    pub fn killed(&self) -> bool {
        self.state.lock().unwrap().killed
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request(stream: &mut TcpStream) -> io::Result<Option<String>> {
    let mut prefix = [0u8; 4];
    if stream.read_exact(&mut prefix).await.is_err() {
        return Ok(None);
    }
    let len = usize::from_str_radix(std::str::from_utf8(&prefix).unwrap(), 16).unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(String::from_utf8(payload).unwrap()))
}

async fn write_prefixed(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    stream.write_all(format!("{:04x}", payload.len()).as_bytes()).await?;
    stream.write_all(payload).await
}

async fn fail(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    stream.write_all(b"FAIL").await?;
    write_prefixed(stream, message.as_bytes()).await
}

async fn wait_for_hangup(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
    }
}

async fn handle(mut stream: TcpStream, state: Arc<Mutex<FakeState>>) -> io::Result<()> {
    while let Some(request) = read_request(&mut stream).await? {
        state.lock().unwrap().requests.push(request.clone());
        match request.as_str() {
            "host:version" => {
                let version = state.lock().unwrap().version;
                stream.write_all(b"OKAY").await?;
                return write_prefixed(&mut stream, format!("{version:04x}").as_bytes()).await;
            }
            "host:devices" | "host:devices-l" => {
                let listing: String =
                    state.lock().unwrap().devices.iter().map(|line| format!("{line}\n")).collect();
                stream.write_all(b"OKAY").await?;
                return write_prefixed(&mut stream, listing.as_bytes()).await;
            }
            "host:track-devices" => {
                let (snapshots, keep_open) = {
                    let state = state.lock().unwrap();
                    (state.track_snapshots.clone(), state.keep_tracking_open)
                };
                stream.write_all(b"OKAY").await?;
                for snapshot in snapshots {
                    write_prefixed(&mut stream, snapshot.as_bytes()).await?;
                }
                if keep_open {
                    wait_for_hangup(&mut stream).await;
                }
                return Ok(());
            }
            "host:kill" => {
                state.lock().unwrap().killed = true;
                return stream.write_all(b"OKAY").await;
            }
            "sync:" => {
                stream.write_all(b"OKAY").await?;
                return sync_session(stream, state).await;
            }
            r if r.starts_with("host:transport:") => {
                let serial = &r["host:transport:".len()..];
                let (known, unreachable) = {
                    let state = state.lock().unwrap();
                    let known = state
                        .devices
                        .iter()
                        .any(|line| line.split_whitespace().next() == Some(serial));
                    (known, state.unreachable.contains(serial))
                };
                if !known {
                    return fail(&mut stream, &format!("device '{serial}' not found")).await;
                }
                if unreachable {
                    return fail(&mut stream, "device offline").await;
                }
                stream.write_all(b"OKAY").await?;
            }
            r if r.starts_with("shell:") || r.starts_with("exec:") => {
                let (output, hold) = {
                    let state = state.lock().unwrap();
                    (state.shell_output(r), state.hold_open.contains(r))
                };
                stream.write_all(b"OKAY").await?;
                stream.write_all(&output).await?;
                if hold {
                    wait_for_hangup(&mut stream).await;
                }
                return Ok(());
            }
            _ => return fail(&mut stream, "unknown host service").await,
        }
    }
    Ok(())
}

async fn read_sync_header(stream: &mut TcpStream) -> io::Result<([u8; 4], u32)> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    let mut id = [0u8; 4];
    id.copy_from_slice(&header[..4]);
    Ok((id, u32::from_le_bytes([header[4], header[5], header[6], header[7]])))
}

async fn write_sync(stream: &mut TcpStream, id: &[u8; 4], payload: &[u8]) -> io::Result<()> {
    stream.write_all(id).await?;
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(payload).await
}

async fn sync_session(mut stream: TcpStream, state: Arc<Mutex<FakeState>>) -> io::Result<()> {
    loop {
        let Ok((id, len)) = read_sync_header(&mut stream).await else { return Ok(()) };
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await?;
        let payload = String::from_utf8(payload).unwrap();
        match &id {
            b"SEND" => {
                let (path, _mode) = payload.rsplit_once(',').unwrap();
                let mut data = Vec::new();
                loop {
                    let (id, len) = read_sync_header(&mut stream).await?;
                    match &id {
                        b"DATA" => {
                            let mut chunk = vec![0u8; len as usize];
                            stream.read_exact(&mut chunk).await?;
                            data.extend_from_slice(&chunk);
                        }
                        b"DONE" => break,
                        _ => return Ok(()),
                    }
                }
                if path.starts_with("/system/") {
                    write_sync(&mut stream, b"FAIL", b"Read-only file system").await?;
                } else {
                    state.lock().unwrap().files.insert(path.to_string(), data);
                    write_sync(&mut stream, b"OKAY", b"").await?;
                }
            }
            b"RECV" => {
                let (file, chunk) = {
                    let state = state.lock().unwrap();
                    (state.files.get(&payload).cloned(), state.recv_chunk)
                };
                match file {
                    Some(data) => {
                        for part in data.chunks(chunk) {
                            write_sync(&mut stream, b"DATA", part).await?;
                        }
                        write_sync(&mut stream, b"DONE", b"").await?;
                    }
                    None => {
                        write_sync(&mut stream, b"FAIL", b"No such file or directory").await?;
                    }
                }
            }
            _ => return Ok(()),
        }
    }
}
