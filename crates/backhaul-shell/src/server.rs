//! Server side of a shell session.
//!
//! Spawns the requested program, with or without a pty, and bridges
//! its streams to the peer. In mux mode everything is framed and the
//! process exit status travels in a final exit frame; otherwise bytes
//! are piped through untouched.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child as PipedChild, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::frame::{read_frame, FrameType, FrameWriter, Winch, MAX_PAYLOAD};
use crate::request::ShellRequest;
use crate::ShellError;

/// Reported when the real exit status cannot be collected. Truncated
/// to a byte on the wire like every other status.
const EXIT_UNKNOWN: i32 = 666;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

type SharedMaster = Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>;

/// Runs shell sessions against a fixed shell program.
pub struct ShellServer {
    program: String,
}

impl ShellServer {
    pub fn new(program: impl Into<String>) -> Self {
        ShellServer {
            program: program.into(),
        }
    }

    /// Drives one session over the given stream halves until the peer
    /// goes away or, in raw mode, the process output ends.
    pub async fn serve<R, W>(
        &self,
        request: &ShellRequest,
        reader: R,
        writer: W,
    ) -> Result<(), ShellError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = Session::spawn(&self.program, request)?;
        let writer = FrameWriter::new(writer);
        let teardown = Arc::new(Teardown {
            fired: AtomicBool::new(false),
            child: Mutex::new(session.child.take()),
            master: Arc::clone(&session.master),
            writer: writer.clone(),
            mux: request.mux,
        });

        if request.mux {
            self.serve_mux(session, reader, writer, teardown).await
        } else {
            self.serve_raw(session, reader, writer, teardown).await
        }
    }

    async fn serve_mux<R, W>(
        &self,
        mut session: Session,
        mut reader: R,
        writer: FrameWriter<W>,
        teardown: Arc<Teardown<W>>,
    ) -> Result<(), ShellError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        // An early ping gets the response body moving through any
        // buffering middleboxes before the process says anything.
        writer.send(FrameType::Ping, &[]).await?;

        tokio::spawn(pump_frames(
            session.stdout,
            FrameType::Stdout,
            writer.clone(),
            Some(Arc::clone(&teardown)),
        ));
        if let Some(stderr) = session.stderr {
            tokio::spawn(pump_frames(stderr, FrameType::Stderr, writer.clone(), None));
        }

        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => match frame.typed() {
                    Some(FrameType::Stdin) | Some(FrameType::Stdout) => {
                        if frame.payload.is_empty() {
                            session.input.close().await;
                        } else {
                            session.input.write(&frame.payload).await;
                        }
                    }
                    Some(FrameType::Winch) => match Winch::decode(&frame.payload) {
                        Some(winch) => session_resize(&session.master, winch).await,
                        None => warn!("short winch frame ignored"),
                    },
                    Some(FrameType::Ping) => {}
                    _ => debug!(frame_type = frame.frame_type, "ignoring unknown frame"),
                },
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "session stream failed");
                    break;
                }
            }
        }
        teardown.run().await;
        Ok(())
    }

    async fn serve_raw<R, W>(
        &self,
        mut session: Session,
        mut reader: R,
        writer: FrameWriter<W>,
        teardown: Arc<Teardown<W>>,
    ) -> Result<(), ShellError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut input = session.input;
        let input_task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_PAYLOAD];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => input.write(&buf[..n]).await,
                }
            }
            input.close().await;
        });

        let stdout_task = tokio::spawn(pump_bytes(session.stdout, writer.clone()));
        let stderr_task = session
            .stderr
            .take()
            .map(|rx| tokio::spawn(pump_bytes(rx, writer.clone())));

        let _ = stdout_task.await;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        teardown.run().await;
        input_task.abort();
        Ok(())
    }
}

async fn pump_frames<W>(
    mut rx: mpsc::Receiver<Vec<u8>>,
    frame_type: FrameType,
    writer: FrameWriter<W>,
    teardown: Option<Arc<Teardown<W>>>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(chunk) = rx.recv().await {
        if writer.send(frame_type, &chunk).await.is_err() {
            break;
        }
    }
    if let Some(teardown) = teardown {
        teardown.run().await;
    }
}

async fn pump_bytes<W>(mut rx: mpsc::Receiver<Vec<u8>>, writer: FrameWriter<W>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        if writer.write_bytes(&chunk).await.is_err() {
            break;
        }
    }
}

enum ChildHandle {
    Pty(Box<dyn Child + Send>),
    Piped(PipedChild),
}

enum ProcessInput {
    Pty(Option<std::sync::mpsc::Sender<Vec<u8>>>),
    Piped(Option<ChildStdin>),
}

impl ProcessInput {
    async fn write(&mut self, data: &[u8]) {
        match self {
            ProcessInput::Pty(Some(tx)) => {
                if tx.send(data.to_vec()).is_err() {
                    *self = ProcessInput::Pty(None);
                }
            }
            ProcessInput::Piped(Some(stdin)) => {
                if let Err(err) = stdin.write_all(data).await {
                    debug!(error = %err, "process input closed");
                    *self = ProcessInput::Piped(None);
                }
            }
            _ => {}
        }
    }

    async fn close(&mut self) {
        match self {
            ProcessInput::Pty(tx) => {
                tx.take();
            }
            ProcessInput::Piped(stdin) => {
                if let Some(mut stdin) = stdin.take() {
                    let _ = stdin.shutdown().await;
                }
            }
        }
    }
}

struct Session {
    input: ProcessInput,
    master: SharedMaster,
    child: Option<ChildHandle>,
    stdout: mpsc::Receiver<Vec<u8>>,
    stderr: Option<mpsc::Receiver<Vec<u8>>>,
}

impl Session {
    fn spawn(program: &str, request: &ShellRequest) -> Result<Session, ShellError> {
        if request.pty {
            Session::spawn_pty(program, request)
        } else {
            Session::spawn_piped(program, request)
        }
    }

    fn spawn_pty(program: &str, request: &ShellRequest) -> Result<Session, ShellError> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| ShellError::Spawn(err.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        if let Some(command) = &request.command {
            cmd.arg("-c");
            cmd.arg(command);
        }
        cmd.env_clear();
        for (key, value) in request.env_pairs() {
            cmd.env(key, value);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| ShellError::Spawn(err.to_string()))?;
        drop(pair.slave);

        let mut pty_writer = pair
            .master
            .take_writer()
            .map_err(|err| ShellError::Spawn(err.to_string()))?;
        let pty_reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| ShellError::Spawn(err.to_string()))?;

        // Pty IO is blocking, so input goes through a channel to a
        // writer thread and output comes back the same way.
        let (in_tx, in_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        std::thread::spawn(move || {
            use std::io::Write;
            for chunk in in_rx {
                if pty_writer.write_all(&chunk).is_err() {
                    break;
                }
            }
        });

        Ok(Session {
            input: ProcessInput::Pty(Some(in_tx)),
            master: Arc::new(Mutex::new(Some(pair.master))),
            child: Some(ChildHandle::Pty(child)),
            stdout: pump_blocking_reader(pty_reader),
            stderr: None,
        })
    }

    fn spawn_piped(program: &str, request: &ShellRequest) -> Result<Session, ShellError> {
        let mut cmd = Command::new(program);
        if let Some(command) = &request.command {
            cmd.arg("-c").arg(command);
        }
        cmd.env_clear();
        for (key, value) in request.env_pairs() {
            cmd.env(key, value);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| ShellError::Spawn(err.to_string()))?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ShellError::Spawn("process stdout missing".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ShellError::Spawn("process stderr missing".into()))?;

        Ok(Session {
            input: ProcessInput::Piped(stdin),
            master: Arc::new(Mutex::new(None)),
            child: Some(ChildHandle::Piped(child)),
            stdout: pump_async_reader(stdout),
            stderr: Some(pump_async_reader(stderr)),
        })
    }
}

async fn session_resize(master: &SharedMaster, winch: Winch) {
    let guard = master.lock().await;
    if let Some(master) = guard.as_ref() {
        let size = PtySize {
            rows: winch.rows,
            cols: winch.cols,
            pixel_width: winch.x,
            pixel_height: winch.y,
        };
        if let Err(err) = master.resize(size) {
            warn!(error = %err, "pty resize failed");
        }
    }
}

fn pump_blocking_reader(mut reader: Box<dyn std::io::Read + Send>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let mut buf = [0u8; MAX_PAYLOAD];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn pump_async_reader<R>(mut reader: R) -> mpsc::Receiver<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_PAYLOAD];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Closes a session exactly once: kills the process, collects the
/// exit status, reports it in mux mode and shuts the stream down.
struct Teardown<W> {
    fired: AtomicBool,
    child: Mutex<Option<ChildHandle>>,
    master: SharedMaster,
    writer: FrameWriter<W>,
    mux: bool,
}

impl<W> Teardown<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        // Drop the master first so the process sees its terminal go
        // away before the kill lands.
        self.master.lock().await.take();
        let child = self.child.lock().await.take();
        let code = match child {
            Some(ChildHandle::Piped(mut child)) => {
                let _ = child.start_kill();
                match child.wait().await {
                    Ok(status) => status.code().unwrap_or(EXIT_UNKNOWN),
                    Err(_) => EXIT_UNKNOWN,
                }
            }
            Some(ChildHandle::Pty(mut child)) => tokio::task::spawn_blocking(move || {
                let _ = child.kill();
                match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(_) => EXIT_UNKNOWN,
                }
            })
            .await
            .unwrap_or(EXIT_UNKNOWN),
            None => EXIT_UNKNOWN,
        };
        debug!(code, "shell session ended");
        if self.mux {
            let _ = self.writer.send(FrameType::Exit, &[code as u8]).await;
        }
        let _ = self.writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn mux_session_runs_a_command() {
        let (client, peer) = tokio::io::duplex(4096);
        let (peer_read, peer_write) = tokio::io::split(peer);
        let handle = tokio::spawn(async move {
            let server = ShellServer::new("/bin/sh");
            let request = ShellRequest {
                mux: true,
                ..ShellRequest::default()
            };
            server.serve(&request, peer_read, peer_write).await
        });

        let (mut client_read, client_write) = tokio::io::split(client);
        let writer = FrameWriter::new(client_write);

        let first = read_frame(&mut client_read).await.unwrap().unwrap();
        assert_eq!(first.typed(), Some(FrameType::Ping));

        writer.send(FrameType::Stdin, b"echo hi\n").await.unwrap();
        writer.send(FrameType::Stdin, &[]).await.unwrap();

        let mut stdout = Vec::new();
        let mut exit = None;
        while let Some(frame) = read_frame(&mut client_read).await.unwrap() {
            match frame.typed() {
                Some(FrameType::Stdout) => stdout.extend_from_slice(&frame.payload),
                Some(FrameType::Exit) => {
                    exit = frame.payload.first().copied();
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(stdout, b"hi\n");
        assert_eq!(exit, Some(0));

        drop(writer);
        drop(client_read);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mux_session_applies_env() {
        let (client, peer) = tokio::io::duplex(4096);
        let (peer_read, peer_write) = tokio::io::split(peer);
        let handle = tokio::spawn(async move {
            let server = ShellServer::new("/bin/sh");
            let request = ShellRequest {
                command: Some("echo $GREETING".into()),
                mux: true,
                env: vec!["GREETING=yo".into()],
                ..ShellRequest::default()
            };
            server.serve(&request, peer_read, peer_write).await
        });

        let (mut client_read, client_write) = tokio::io::split(client);
        let mut stdout = Vec::new();
        while let Some(frame) = read_frame(&mut client_read).await.unwrap() {
            match frame.typed() {
                Some(FrameType::Stdout) => stdout.extend_from_slice(&frame.payload),
                Some(FrameType::Exit) => break,
                _ => {}
            }
        }
        assert_eq!(stdout, b"yo\n");

        drop(client_write);
        drop(client_read);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn raw_session_pipes_output() {
        let (client, peer) = tokio::io::duplex(1024);
        let (peer_read, peer_write) = tokio::io::split(peer);
        let handle = tokio::spawn(async move {
            let server = ShellServer::new("/bin/sh");
            let request = ShellRequest {
                command: Some("echo raw".into()),
                ..ShellRequest::default()
            };
            server.serve(&request, peer_read, peer_write).await
        });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.shutdown().await.unwrap();
        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"raw\n");
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn teardown_reports_exit_once() {
        let (mut client, peer) = tokio::io::duplex(1024);
        let mut cmd = Command::new("/bin/cat");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = cmd.spawn().unwrap();

        let teardown = Arc::new(Teardown {
            fired: AtomicBool::new(false),
            child: Mutex::new(Some(ChildHandle::Piped(child))),
            master: Arc::new(Mutex::new(None)),
            writer: FrameWriter::new(peer),
            mux: true,
        });
        let other = Arc::clone(&teardown);
        tokio::join!(teardown.run(), other.run());

        let mut exits = 0;
        while let Some(frame) = read_frame(&mut client).await.unwrap() {
            if frame.typed() == Some(FrameType::Exit) {
                exits += 1;
            }
        }
        assert_eq!(exits, 1);
    }

    #[tokio::test]
    async fn winch_resizes_the_pty() {
        let request = ShellRequest {
            pty: true,
            mux: true,
            ..ShellRequest::default()
        };
        let mut session = Session::spawn("/bin/cat", &request).unwrap();

        let winch = Winch {
            rows: 40,
            cols: 120,
            x: 0,
            y: 0,
        };
        let decoded = Winch::decode(&winch.encode()).unwrap();
        session_resize(&session.master, decoded).await;
        let size = {
            let guard = session.master.lock().await;
            guard.as_ref().unwrap().get_size().unwrap()
        };
        assert_eq!((size.rows, size.cols), (40, 120));

        session.input.close().await;
        if let Some(ChildHandle::Pty(mut child)) = session.child.take() {
            let _ = child.kill();
            let _ = tokio::task::spawn_blocking(move || child.wait()).await;
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let (_client, peer) = tokio::io::duplex(64);
        let (peer_read, peer_write) = tokio::io::split(peer);
        let server = ShellServer::new("/does/not/exist");
        let request = ShellRequest {
            mux: true,
            ..ShellRequest::default()
        };
        let result = server.serve(&request, peer_read, peer_write).await;
        assert!(matches!(result, Err(ShellError::Spawn(_))));
    }
}
