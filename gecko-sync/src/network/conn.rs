use std::{collections::VecDeque, io, process::Stdio, sync::Mutex};

use bytes::{BufMut, BytesMut};
use log::{debug, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{lookup_host, TcpListener, TcpSocket, TcpStream},
    process::{Child, Command},
    sync::{self, Notify},
};

use crate::lock;

use super::{
    description::{ConnectionDescription, Protocol},
    packet::Packet,
    Error,
};

/// listen 的 backlog
const LISTEN_BACKLOG: u32 = 10;
/// 进程内管道的缓冲区大小
const PIPE_BUFFER: usize = 256 * 1024;

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Connecting,
    Connected,
    Listening,
}

/// 一次就绪等待的结果
#[derive(Debug)]
pub enum Readiness {
    /// 监听连接上有新的对端接入
    Connect,
    /// 有数据可读
    Data,
    /// 对端关闭或连接已失效
    Disconnect,
    /// 监听出错
    Error(io::Error),
}

/// 字节流端点：tcp 套接字，进程内管道或子进程管道
///
/// 上层代码以相同的方式对待所有类型的连接。连接关闭后不再复用。
pub struct Connection {
    description: Mutex<ConnectionDescription>,
    state: Mutex<State>,
    reader: sync::Mutex<Option<BufReader<BoxRead>>>,
    writer: sync::Mutex<Option<BoxWrite>>,
    listener: sync::Mutex<Option<TcpListener>>,
    /// 就绪等待期间已经 accept 的连接
    accepted: Mutex<VecDeque<TcpStream>>,
    child: Mutex<Option<Child>>,
    closed: Notify,
}

impl Connection {
    pub fn new(description: ConnectionDescription) -> Self {
        Self {
            description: Mutex::new(description),
            state: Mutex::new(State::Closed),
            reader: sync::Mutex::new(None),
            writer: sync::Mutex::new(None),
            listener: sync::Mutex::new(None),
            accepted: Mutex::new(VecDeque::new()),
            child: Mutex::new(None),
            closed: Notify::new(),
        }
    }

    /// 进程内回环管道，写入的数据可以从同一个连接读出
    pub fn pipe() -> Self {
        let conn = Self::new(ConnectionDescription::pipe());
        conn.set_loopback();
        conn
    }

    /// 一对相互连接的进程内管道
    pub fn pipe_pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PIPE_BUFFER);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Self::from_parts(ConnectionDescription::pipe(), a_read, a_write),
            Self::from_parts(ConnectionDescription::pipe(), b_read, b_write),
        )
    }

    /// 使用已建立的 tcp 连接
    pub fn from_stream(stream: TcpStream) -> Self {
        let mut description = ConnectionDescription::tcp("", 0);
        if let Ok(addr) = stream.peer_addr() {
            description.hostname = addr.ip().to_string();
            description.port = addr.port();
        }
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Self::from_parts(description, read, write)
    }

    /// 使用任意的读写端，连接直接处于已连接状态
    pub fn from_parts<R, W>(description: ConnectionDescription, read: R, write: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Self::new(description);
        conn.set_halves(Box::new(read), Box::new(write));
        conn
    }

    /// 当前进程的标准输入输出，被 Process 连接启动的子进程使用
    pub fn stdio() -> Self {
        Self::from_parts(
            ConnectionDescription::process(""),
            tokio::io::stdin(),
            tokio::io::stdout(),
        )
    }

    pub fn description(&self) -> ConnectionDescription {
        lock(&self.description).clone()
    }

    pub fn state(&self) -> State {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn is_listening(&self) -> bool {
        self.state() == State::Listening
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    fn set_state(&self, state: State) {
        *lock(&self.state) = state;
    }

    fn set_halves(&self, read: BoxRead, write: BoxWrite) {
        // 新建的连接，锁不会被占用
        if let Ok(mut reader) = self.reader.try_lock() {
            *reader = Some(BufReader::new(read));
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = Some(write);
        }
        self.set_state(State::Connected);
    }

    fn set_loopback(&self) {
        let (a, b) = tokio::io::duplex(PIPE_BUFFER);
        let (_, write) = tokio::io::split(a);
        let (read, _) = tokio::io::split(b);
        self.set_halves(Box::new(read), Box::new(write));
    }

    /// 根据描述建立连接，失败时连接保持关闭状态
    pub async fn connect(&self) -> Result<(), Error> {
        if self.state() != State::Closed {
            return Err(Error::InvalidState(self.state()));
        }
        self.set_state(State::Connecting);
        let description = self.description();

        let res = match description.protocol {
            Protocol::Tcp => self.connect_tcp(&description).await,
            Protocol::Pipe => {
                self.set_loopback();
                Ok(())
            }
            Protocol::Process => self.connect_process(&description),
        };
        if res.is_err() {
            self.set_state(State::Closed);
        }
        res
    }

    async fn connect_tcp(&self, description: &ConnectionDescription) -> Result<(), Error> {
        let stream = TcpStream::connect(description.address()).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        self.set_halves(Box::new(read), Box::new(write));
        debug!("connected to {}", description);
        Ok(())
    }

    fn connect_process(&self, description: &ConnectionDescription) -> Result<(), Error> {
        let command = description
            .launch_command
            .as_deref()
            .filter(|cmd| !cmd.is_empty())
            .ok_or_else(|| Error::InvalidAddress(description.to_string()))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err(Error::InvalidState(State::Connecting)),
        };
        self.set_halves(Box::new(stdout), Box::new(stdin));
        *lock(&self.child) = Some(child);
        debug!("spawned {}", description);
        Ok(())
    }

    /// 开始监听，端口为 0 时由系统分配，实际端口写回描述
    pub async fn listen(&self) -> Result<(), Error> {
        if self.state() != State::Closed {
            return Err(Error::InvalidState(self.state()));
        }
        let description = self.description();
        if description.protocol != Protocol::Tcp {
            return Err(Error::InvalidAddress(description.to_string()));
        }

        let addr = lookup_host(description.address())
            .await?
            .next()
            .ok_or_else(|| Error::InvalidAddress(description.to_string()))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let local = listener.local_addr()?;

        {
            let mut description = lock(&self.description);
            description.port = local.port();
            if description.hostname.is_empty() {
                description.hostname = local.ip().to_string();
            }
        }
        *self.listener.lock().await = Some(listener);
        self.set_state(State::Listening);
        debug!("listening on {}", local);
        Ok(())
    }

    /// 接受一个新连接，新连接不继承监听连接的任何状态
    pub async fn accept(&self) -> Result<Connection, Error> {
        if self.state() != State::Listening {
            return Err(Error::InvalidState(self.state()));
        }
        if let Some(stream) = lock(&self.accepted).pop_front() {
            return Ok(Connection::from_stream(stream));
        }

        let guard = self.listener.lock().await;
        let listener = guard.as_ref().ok_or(Error::InvalidState(State::Closed))?;
        loop {
            match listener.accept().await {
                Ok((stream, _)) => return Ok(Connection::from_stream(stream)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// 等待连接就绪，不消耗数据
    pub async fn poll_ready(&self) -> Readiness {
        let closed = self.closed.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();

        match self.state() {
            State::Listening => {
                let mut guard = self.listener.lock().await;
                let readiness = match guard.as_ref() {
                    Some(listener) => loop {
                        tokio::select! {
                            res = listener.accept() => match res {
                                Ok((stream, _)) => {
                                    lock(&self.accepted).push_back(stream);
                                    break Readiness::Connect;
                                }
                                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                                Err(e) => break Readiness::Error(e),
                            },
                            _ = closed.as_mut() => break Readiness::Disconnect,
                        }
                    },
                    None => Readiness::Disconnect,
                };
                if self.is_closed() {
                    guard.take();
                }
                readiness
            }
            State::Connected => {
                let mut guard = self.reader.lock().await;
                let readiness = match guard.as_mut() {
                    Some(reader) => loop {
                        tokio::select! {
                            res = reader.fill_buf() => match res {
                                Ok([]) => break Readiness::Disconnect,
                                Ok(_) => break Readiness::Data,
                                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                                Err(e) => {
                                    debug!("connection read error: {}", e);
                                    break Readiness::Disconnect;
                                }
                            },
                            _ = closed.as_mut() => break Readiness::Disconnect,
                        }
                    },
                    None => Readiness::Disconnect,
                };
                if self.is_closed() {
                    guard.take();
                }
                readiness
            }
            State::Closed | State::Connecting => Readiness::Disconnect,
        }
    }

    /// 读满 buf，返回实际读取的字节数
    ///
    /// 对端关闭时连接被关闭，其他错误中止读取，调用方应把不足的结果视为连接失败
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        let mut guard = self.reader.lock().await;
        let reader = match guard.as_mut() {
            Some(reader) => reader,
            None => return 0,
        };

        let mut done = 0;
        while done < buf.len() {
            match reader.read(&mut buf[done..]).await {
                Ok(0) => {
                    debug!("connection closed by peer");
                    guard.take();
                    drop(guard);
                    self.close();
                    return done;
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("error during read: {}", e);
                    return done;
                }
            }
        }
        done
    }

    /// 写出全部 buf，返回实际写入的字节数
    pub async fn write(&self, buf: &[u8]) -> usize {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => return 0,
        };

        let mut done = 0;
        while done < buf.len() {
            match writer.write(&buf[done..]).await {
                Ok(0) => {
                    warn!("connection refused further writes");
                    return done;
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("error during write: {}", e);
                    return done;
                }
            }
        }
        loop {
            match writer.flush().await {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("error during flush: {}", e);
                    break;
                }
            }
        }
        done
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<(), Error> {
        let n = self.read(buf).await;
        if n != buf.len() {
            return Err(Error::ShortRead {
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    pub async fn send(&self, buf: &[u8]) -> Result<(), Error> {
        let n = self.write(buf).await;
        if n != buf.len() {
            return Err(Error::ShortWrite {
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    /// 整个报文在一次写锁内写出，不会和其他报文交错
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), Error> {
        self.send(packet.as_bytes()).await
    }

    /// 读取一个完整报文，size 字段超出 max 视为协议错误
    pub async fn recv_packet(&self, max: u64) -> Result<Packet, Error> {
        let mut size = [0u8; 8];
        self.recv(&mut size).await?;
        let size = u64::from_le_bytes(size);
        let len = Packet::check_size(size, max)?;

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u64_le(size);
        buf.resize(len, 0);
        self.recv(&mut buf[8..]).await?;
        Ok(Packet::from_bytes(buf)?)
    }

    /// 关闭连接，释放底层资源。可重复调用
    pub fn close(&self) {
        {
            let mut state = lock(&self.state);
            if *state == State::Closed {
                return;
            }
            *state = State::Closed;
        }
        // 正在被使用的读写端由持有者在使用结束后释放
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut listener) = self.listener.try_lock() {
            listener.take();
        }
        lock(&self.accepted).clear();
        if let Some(mut child) = lock(&self.child).take() {
            let _ = child.start_kill();
        }
        self.closed.notify_waiters();
        debug!("connection {} closed", self.description());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("description", &self.description())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        sync::{Arc, Mutex},
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::io::ReadBuf;

    use super::*;
    use crate::network::packet::{self, DATATYPE_USER};

    /// 每次最多读出 chunk 字节，并且交替返回 Interrupted
    struct TrickleReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        interrupt: bool,
    }

    impl TrickleReader {
        fn new(data: &[u8], chunk: usize) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
                chunk,
                interrupt: true,
            }
        }
    }

    impl AsyncRead for TrickleReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.interrupt {
                self.interrupt = false;
                return Poll::Ready(Err(io::ErrorKind::Interrupted.into()));
            }
            self.interrupt = true;
            let pos = self.pos;
            let n = self.chunk.min(self.data.len() - pos).min(buf.remaining());
            buf.put_slice(&self.data[pos..pos + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    /// 每次最多写入 chunk 字节，写满 limit 后返回错误
    struct TrickleWriter {
        sink: Arc<Mutex<Vec<u8>>>,
        chunk: usize,
        limit: usize,
        interrupt: bool,
    }

    impl AsyncWrite for TrickleWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.interrupt {
                self.interrupt = false;
                return Poll::Ready(Err(io::ErrorKind::Interrupted.into()));
            }
            self.interrupt = true;
            let mut sink = self.sink.lock().unwrap();
            if sink.len() >= self.limit {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let n = self.chunk.min(buf.len()).min(self.limit - sink.len());
            sink.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn trickle(data: &[u8], chunk: usize, limit: usize) -> (Connection, Arc<Mutex<Vec<u8>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let writer = TrickleWriter {
            sink: sink.clone(),
            chunk,
            limit,
            interrupt: true,
        };
        let conn = Connection::from_parts(
            ConnectionDescription::pipe(),
            TrickleReader::new(data, chunk),
            writer,
        );
        (conn, sink)
    }

    #[tokio::test]
    async fn partial_reads_are_completed() {
        let data: Vec<u8> = (0..=255).collect();
        for chunk in [1, 3, 7, 100] {
            let (conn, _) = trickle(&data, chunk, 0);
            let mut buf = vec![0; 200];
            assert_eq!(conn.read(&mut buf).await, 200);
            assert_eq!(&buf[..], &data[..200]);
            assert!(conn.is_connected());
        }
    }

    #[tokio::test]
    async fn eof_closes_connection() {
        let (conn, _) = trickle(&[1, 2, 3, 4, 5], 2, 0);
        let mut buf = [0; 8];
        assert_eq!(conn.read(&mut buf).await, 5);
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);
        assert!(conn.is_closed());
        assert!(matches!(
            conn.recv(&mut buf).await,
            Err(Error::ShortRead { expected: 8, actual: 0 })
        ));
    }

    #[tokio::test]
    async fn partial_writes_are_completed() {
        let data: Vec<u8> = (0..100).collect();
        for chunk in [1, 4, 33] {
            let (conn, sink) = trickle(&[], chunk, usize::MAX);
            assert_eq!(conn.write(&data).await, 100);
            assert_eq!(&sink.lock().unwrap()[..], &data[..]);
        }
    }

    #[tokio::test]
    async fn write_error_reports_transferred_bytes() {
        let (conn, sink) = trickle(&[], 8, 20);
        assert_eq!(conn.write(&[7; 64]).await, 20);
        assert_eq!(sink.lock().unwrap().len(), 20);
        assert!(matches!(
            conn.send(&[7; 4]).await,
            Err(Error::ShortWrite { expected: 4, actual: 0 })
        ));
    }

    #[tokio::test]
    async fn packet_over_loopback_pipe() {
        let conn = Connection::pipe();
        let packet = Packet::new(DATATYPE_USER, 3, b"abcdef");
        conn.send_packet(&packet).await.unwrap();
        assert!(matches!(conn.poll_ready().await, Readiness::Data));
        let received = conn.recv_packet(1024).await.unwrap();
        assert_eq!(received, packet);
    }

    #[tokio::test]
    async fn oversized_packet_rejected() {
        let conn = Connection::pipe();
        conn.send_packet(&Packet::new(DATATYPE_USER, 0, &[0; 64]))
            .await
            .unwrap();
        assert!(matches!(
            conn.recv_packet(32).await,
            Err(Error::Packet(packet::Error::SizeTooLarge { size: 80, max: 32 }))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let conn = Connection::pipe();
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.write(&[1]).await, 0);
        assert!(matches!(conn.poll_ready().await, Readiness::Disconnect));
    }

    #[tokio::test]
    async fn close_wakes_pending_poll() {
        let conn = Arc::new(Connection::pipe());
        let waiter = tokio::spawn({
            let conn = conn.clone();
            async move { conn.poll_ready().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();
        let readiness = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(readiness, Readiness::Disconnect));
    }

    #[tokio::test]
    async fn tcp_listen_accept_connect() {
        let listener = Connection::new(ConnectionDescription::tcp("127.0.0.1", 0));
        listener.listen().await.unwrap();
        let port = listener.description().port;
        assert_ne!(port, 0);

        let client = Connection::new(ConnectionDescription::tcp("127.0.0.1", port));
        client.connect().await.unwrap();
        assert!(matches!(listener.poll_ready().await, Readiness::Connect));
        let server = listener.accept().await.unwrap();
        assert!(server.is_connected());

        client.send(b"ping").await.unwrap();
        let mut buf = [0; 4];
        server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client.close();
        assert!(matches!(server.poll_ready().await, Readiness::Disconnect));
    }

    #[tokio::test]
    async fn connect_refused_stays_closed() {
        let listener = Connection::new(ConnectionDescription::tcp("127.0.0.1", 0));
        listener.listen().await.unwrap();
        let port = listener.description().port;
        listener.close();

        let client = Connection::new(ConnectionDescription::tcp("127.0.0.1", port));
        assert!(client.connect().await.is_err());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn process_round_trip_through_cat() {
        let conn = Connection::new(ConnectionDescription::process("cat"));
        conn.connect().await.unwrap();
        assert!(conn.is_connected());

        conn.send(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), conn.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello");
        conn.close();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn process_without_command_rejected() {
        let mut missing = ConnectionDescription::process("cat");
        missing.launch_command = None;
        for description in [ConnectionDescription::process(""), missing] {
            let conn = Connection::new(description);
            assert!(matches!(conn.connect().await, Err(Error::InvalidAddress(_))));
            assert!(conn.is_closed());
        }
    }
}
