use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::control::{Command, CommandResponse, CommandStatus};
use crate::error::Result;
use crate::ipc::codec::{decode, encode, FrameReader};
use crate::reactor::{Callback, Context, Mailbox, Notice, ServerEvent};

pub type ClientId = u64;

const READ_CHUNK: usize = 4096;

struct Connection {
    stream: UnixStream,
    reader: FrameReader,
    outbox: Vec<u8>,
    wants_write: bool,
}

fn post(mailbox: &Mailbox, event: ServerEvent) -> Callback {
    let mailbox = mailbox.clone();
    Box::new(move || {
        mailbox.post(Notice::Server(event));
        Ok(())
    })
}

/*
    @@@
    @ControlServer;
    . Non-blocking Unix socket listener plus its connections, all registered with the EventLoop.
    . Readiness callbacks only post ServerEvents; the runtime calls back into accept()/service().
    . Complete frames are decoded into Commands and posted as Notice::Control; malformed frames get a TYPE_ERROR answer.
*/
pub struct ControlServer {
    ctx: Context,
    path: PathBuf,
    listener: UnixListener,
    connections: HashMap<ClientId, Connection>,
    next_id: ClientId,
}

impl ControlServer {
    pub fn bind(ctx: &Context, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // a socket left behind by a previous daemon
        if let Ok(meta) = fs::symlink_metadata(&path) {
            if meta.file_type().is_socket() {
                fs::remove_file(&path)?;
            }
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        ctx.event_loop()
            .register(listener.as_raw_fd(), Some(post(ctx.mailbox(), ServerEvent::Accept)), None)?;
        info!(path = %path.display(), "control socket listening");
        Ok(Self {
            ctx: ctx.clone(),
            path,
            listener,
            connections: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn clients(&self) -> usize {
        self.connections.len()
    }

    pub fn accept(&mut self) {
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    return;
                }
            };
            if let Err(err) = self.add(stream) {
                warn!(error = %err, "failed to set up client connection");
            }
        }
    }

    fn add(&mut self, stream: UnixStream) -> Result<()> {
        stream.set_nonblocking(true)?;
        self.next_id += 1;
        let client = self.next_id;
        self.ctx.event_loop().register(
            stream.as_raw_fd(),
            Some(post(self.ctx.mailbox(), ServerEvent::Ready(client))),
            None,
        )?;
        debug!(client, "client connected");
        self.connections.insert(
            client,
            Connection {
                stream,
                reader: FrameReader::new(),
                outbox: Vec::new(),
                wants_write: false,
            },
        );
        // data may already be waiting and the edge was before registration
        self.ctx.mailbox().post(Notice::Server(ServerEvent::Ready(client)));
        Ok(())
    }

    /*
        @@@
        @service();
        . Flushes pending output, then reads until the socket would block.
        . EOF or an I/O error closes the connection.
    */
    pub fn service(&mut self, client: ClientId) {
        if !self.flush(client) {
            return;
        }
        let mut closed = false;
        let mut replies = Vec::new();
        {
            let Some(conn) = self.connections.get_mut(&client) else { return };
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.reader.extend(&chunk[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(client, error = %err, "read failed");
                        closed = true;
                        break;
                    }
                }
            }
            loop {
                match conn.reader.next_frame() {
                    Ok(Some(payload)) => match decode::<Command>(&payload) {
                        Ok(command) => self.ctx.mailbox().post(Notice::Control { client, command }),
                        Err(err) => replies.push(CommandResponse::new(CommandStatus::TypeError, err.to_string())),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(client, error = %err, "unreadable frame, dropping client");
                        closed = true;
                        break;
                    }
                }
            }
        }
        for reply in &replies {
            self.respond(client, reply);
        }
        if closed {
            self.close(client);
        }
    }

    /// Queues a response; a client that left in the meantime is skipped.
    pub fn respond(&mut self, client: ClientId, response: &CommandResponse) {
        let frame = match encode(response) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(client, error = %err, "failed to encode response");
                return;
            }
        };
        let Some(conn) = self.connections.get_mut(&client) else {
            debug!(client, "response for a client that is gone");
            return;
        };
        conn.outbox.extend_from_slice(&frame);
        self.flush(client);
    }

    // Returns false when the connection was closed.
    fn flush(&mut self, client: ClientId) -> bool {
        let Some(conn) = self.connections.get_mut(&client) else {
            return false;
        };
        while !conn.outbox.is_empty() {
            match conn.stream.write(&conn.outbox) {
                Ok(0) => break,
                Ok(n) => {
                    conn.outbox.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(client, error = %err, "write failed");
                    self.close(client);
                    return false;
                }
            }
        }

        let wants_write = !conn.outbox.is_empty();
        if wants_write != conn.wants_write {
            conn.wants_write = wants_write;
            let mailbox = self.ctx.mailbox();
            let on_writable = wants_write.then(|| post(mailbox, ServerEvent::Ready(client)));
            let updated = self.ctx.event_loop().update(
                conn.stream.as_raw_fd(),
                Some(post(mailbox, ServerEvent::Ready(client))),
                on_writable,
            );
            if let Err(err) = updated {
                warn!(client, error = %err, "failed to update write interest");
            }
        }
        true
    }

    fn close(&mut self, client: ClientId) {
        if let Some(conn) = self.connections.remove(&client) {
            if let Err(err) = self.ctx.event_loop().unregister(conn.stream.as_raw_fd()) {
                warn!(client, error = %err, "failed to unregister client");
            }
            debug!(client, "client disconnected");
        }
    }

    pub fn has_pending_output(&self) -> bool {
        self.connections.values().any(|conn| !conn.outbox.is_empty())
    }

    /// Drops every client, unsent responses included.
    pub fn close_all(&mut self) {
        let clients: Vec<ClientId> = self.connections.keys().copied().collect();
        for client in clients {
            self.close(client);
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.close_all();
        let _ = self.ctx.event_loop().unregister(self.listener.as_raw_fd());
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CommandType;
    use crate::ipc::codec::{read_frame, write_frame};
    use std::time::{Duration, Instant};

    // Cycles the loop and services the server until a control command shows up.
    fn next_command(ctx: &Context, server: &mut ControlServer) -> Option<(ClientId, Command)> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            ctx.event_loop().run_once(Some(Duration::from_millis(20))).unwrap();
            for notice in ctx.mailbox().drain() {
                match notice {
                    Notice::Server(ServerEvent::Accept) => server.accept(),
                    Notice::Server(ServerEvent::Ready(client)) => server.service(client),
                    Notice::Control { client, command } => return Some((client, command)),
                    _ => {}
                }
            }
        }
        None
    }

    #[test]
    fn commands_flow_in_and_responses_flow_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let ctx = Context::new().unwrap();
        let mut server = ControlServer::bind(&ctx, &path).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        write_frame(&mut client, &Command::new(CommandType::Status, vec!["web".into()])).unwrap();

        let (id, command) = next_command(&ctx, &mut server).unwrap();
        assert_eq!(command, Command::new(CommandType::Status, vec!["web".into()]));
        assert_eq!(server.clients(), 1);

        server.respond(id, &CommandResponse::ok("fine"));
        let response: CommandResponse = read_frame(&mut client).unwrap().unwrap();
        assert_eq!(response, CommandResponse::ok("fine"));

        drop(client);
        let deadline = Instant::now() + Duration::from_secs(3);
        while server.clients() > 0 && Instant::now() < deadline {
            next_command_once(&ctx, &mut server);
        }
        assert_eq!(server.clients(), 0);
        assert_eq!(ctx.event_loop().registered(), 1);
    }

    #[test]
    fn malformed_frames_get_a_type_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let ctx = Context::new().unwrap();
        let mut server = ControlServer::bind(&ctx, &path).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        let body = br#"{"type":"explode"}"#;
        client.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
        client.write_all(body).unwrap();
        client.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut response = None;
        while response.is_none() && Instant::now() < deadline {
            next_command_once(&ctx, &mut server);
            response = read_frame::<_, CommandResponse>(&mut client).ok().flatten();
        }
        assert_eq!(response.unwrap().status, CommandStatus::TypeError);
    }

    fn next_command_once(ctx: &Context, server: &mut ControlServer) {
        ctx.event_loop().run_once(Some(Duration::from_millis(20))).unwrap();
        for notice in ctx.mailbox().drain() {
            match notice {
                Notice::Server(ServerEvent::Accept) => server.accept(),
                Notice::Server(ServerEvent::Ready(client)) => server.service(client),
                _ => {}
            }
        }
    }

    #[test]
    fn close_all_gives_up_on_clients_that_never_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let ctx = Context::new().unwrap();
        let mut server = ControlServer::bind(&ctx, &path).unwrap();

        let _silent = UnixStream::connect(&path).unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while server.clients() == 0 && Instant::now() < deadline {
            next_command_once(&ctx, &mut server);
        }
        let client = *server.connections.keys().next().unwrap();

        let bulk = CommandResponse::ok("x".repeat(512 * 1024));
        for _ in 0..8 {
            server.respond(client, &bulk);
        }
        assert!(server.has_pending_output());

        server.close_all();
        assert_eq!(server.clients(), 0);
        assert!(!server.has_pending_output());
        assert_eq!(ctx.event_loop().registered(), 1);
    }

    #[test]
    fn stale_socket_files_are_replaced_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let ctx = Context::new().unwrap();
        drop(ControlServer::bind(&ctx, &path).unwrap());
        assert!(!path.exists());

        let _leftover = UnixListener::bind(&path).unwrap();
        let server = ControlServer::bind(&ctx, &path).unwrap();
        assert_eq!(server.path(), path.as_path());
        drop(server);
        assert_eq!(ctx.event_loop().registered(), 0);
    }
}
