//! Long-lived WebSocket session: frame loop, fragmentation assembly,
//! control-frame handling and the per-session outbound queue.

use crate::errors::{Error, Result};
use crate::ws::frame::{self, close_code, encode_frame, Frame, OpCode};
use crate::ws::registry::WsRegistry;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Payload interpretation of a complete message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Application callbacks for one WebSocket route.
///
/// All callbacks run on the session's own task, in frame arrival order, and
/// must not block; long work belongs on a worker pool with results sent back
/// through the [`WsSender`].
pub trait WsHandler: Send + Sync + 'static {
    fn on_connect(&self, _session: &WsSender) {}
    fn on_message(&self, _session: &WsSender, _kind: MessageKind, _payload: &[u8]) {}
    fn on_close(&self, _session: &WsSender, _code: u16, _reason: &[u8]) {}
    fn on_error(&self, _session: &WsSender, _error: &Error) {}
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    Close(u16, Vec<u8>),
}

/// Cloneable handle for sending into a session from callbacks or other
/// tasks. Sends are queued and written by the session task, so application
/// send order is preserved.
#[derive(Clone)]
pub struct WsSender {
    pub(crate) id: u64,
    pub(crate) path: Arc<str>,
    pub(crate) tx: mpsc::UnboundedSender<Outbound>,
}

impl WsSender {
    /// Session id, unique per server.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Path the session was established on.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.enqueue(Outbound::Frame(Frame::text(text.into().into_bytes())))
    }

    pub fn send_binary(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.enqueue(Outbound::Frame(Frame::binary(payload)))
    }

    pub fn send_ping(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.enqueue(Outbound::Frame(Frame::ping(payload)))
    }

    /// Initiates a close handshake with the given code.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        self.enqueue(Outbound::Close(code, reason.as_bytes().to_vec()))
    }

    fn enqueue(&self, outbound: Outbound) -> Result<()> {
        self.tx.send(outbound).map_err(|_| Error::WsClosed)
    }
}

enum Step {
    Continue,
    Reply(Frame),
    Close { write: Option<Frame>, code: u16 },
}

pub(crate) struct WsSession {
    handler: Arc<dyn WsHandler>,
    sender: WsSender,
    rx: mpsc::UnboundedReceiver<Outbound>,
    registry: Option<Arc<WsRegistry>>,
    max_frame: usize,
    max_message: usize,
    fragment_kind: Option<MessageKind>,
    fragment: Vec<u8>,
    close_sent: bool,
}

impl WsSession {
    pub(crate) fn new(
        handler: Arc<dyn WsHandler>,
        sender: WsSender,
        rx: mpsc::UnboundedReceiver<Outbound>,
        registry: Option<Arc<WsRegistry>>,
        max_frame: usize,
        max_message: usize,
    ) -> Self {
        Self {
            handler,
            sender,
            rx,
            registry,
            max_frame,
            max_message,
            fragment_kind: None,
            fragment: Vec::new(),
            close_sent: false,
        }
    }

    /// Drives the session until close or error. The HTTP connection calls
    /// this after the 101 response with any bytes that arrived behind the
    /// handshake; when it returns, the underlying socket is torn down.
    pub(crate) async fn run<S>(mut self, stream: &mut S, initial: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.handler.on_connect(&self.sender);

        let mut buf = BytesMut::with_capacity(8 * 1024);
        buf.extend_from_slice(initial);
        let mut close_code_seen = close_code::NORMAL;
        let mut close_reason: Vec<u8> = Vec::new();

        'session: loop {
            // drain complete frames (including any that arrived with the
            // handshake) before waiting on I/O
            loop {
                match frame::parse_frame(&buf, self.max_frame, true) {
                    Ok(None) => break,
                    Ok(Some((frame, consumed))) => {
                        buf.advance(consumed);
                        match self.handle_frame(frame) {
                            Ok(Step::Continue) => {}
                            Ok(Step::Reply(reply)) => {
                                stream.write_all(&encode_frame(&reply, None)).await?;
                            }
                            Ok(Step::Close { write, code }) => {
                                if let Some(close) = &write {
                                    let (_, reason) = close.close_parts();
                                    close_reason = reason.to_vec();
                                    stream.write_all(&encode_frame(close, None)).await?;
                                }
                                close_code_seen = code;
                                break 'session;
                            }
                            Err(e) => {
                                close_code_seen = self.fail(stream, &e).await;
                                break 'session;
                            }
                        }
                    }
                    Err(e) => {
                        close_code_seen = self.fail(stream, &e).await;
                        break 'session;
                    }
                }
            }

            // outbound first: queued application frames are flushed before
            // the next read, which also keeps send order ahead of EOF
            tokio::select! {
                biased;

                outbound = self.rx.recv() => {
                    match outbound {
                        Some(Outbound::Frame(frame)) => {
                            stream.write_all(&encode_frame(&frame, None)).await?;
                            if frame.opcode == OpCode::Ping {
                                if let Some(registry) = &self.registry {
                                    registry.mark_ping_sent(self.sender.id);
                                }
                            }
                        }
                        Some(Outbound::Close(code, reason)) => {
                            self.close_sent = true;
                            let close = Frame::close(code, &reason);
                            let _ = stream.write_all(&encode_frame(&close, None)).await;
                            close_code_seen = code;
                            close_reason = reason;
                            break 'session;
                        }
                        // the session keeps one sender alive, so the queue
                        // never closes before the session does
                        None => break 'session,
                    }
                }
                read = stream.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => break 'session,
                        Ok(_) => {}
                        Err(e) => {
                            let e = Error::Io(e);
                            self.handler.on_error(&self.sender, &e);
                            break 'session;
                        }
                    }
                }
            }
        }

        if let Some(registry) = &self.registry {
            registry.remove(self.sender.id);
        }
        self.handler
            .on_close(&self.sender, close_code_seen, &close_reason);
        Ok(())
    }

    async fn fail<S>(&mut self, stream: &mut S, error: &Error) -> u16
    where
        S: AsyncWrite + Unpin,
    {
        let code = match error {
            Error::WsMessageTooLarge => close_code::MESSAGE_TOO_BIG,
            _ => close_code::PROTOCOL_ERROR,
        };
        self.handler.on_error(&self.sender, error);
        if !self.close_sent {
            self.close_sent = true;
            let close = Frame::close(code, error.to_string().as_bytes());
            let _ = stream.write_all(&encode_frame(&close, None)).await;
        }
        code
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Step> {
        if let Some(registry) = &self.registry {
            registry.touch(self.sender.id);
        }

        match frame.opcode {
            OpCode::Ping => Ok(Step::Reply(Frame::pong(frame.payload))),
            OpCode::Pong => Ok(Step::Continue),
            OpCode::Close => {
                let (code, _) = frame.close_parts();
                let write = if self.close_sent {
                    None
                } else {
                    self.close_sent = true;
                    Some(Frame {
                        fin: true,
                        opcode: OpCode::Close,
                        payload: frame.payload.clone(),
                    })
                };
                Ok(Step::Close { write, code })
            }
            OpCode::Text | OpCode::Binary => {
                if self.fragment_kind.is_some() {
                    return Err(Error::WsProtocol("data frame inside fragmented message"));
                }
                let kind = match frame.opcode {
                    OpCode::Text => MessageKind::Text,
                    _ => MessageKind::Binary,
                };
                if frame.fin {
                    self.deliver(kind, &frame.payload)?;
                } else {
                    self.fragment_kind = Some(kind);
                    self.fragment.clear();
                    self.append_fragment(&frame.payload)?;
                }
                Ok(Step::Continue)
            }
            OpCode::Continuation => {
                let kind = self
                    .fragment_kind
                    .ok_or(Error::WsProtocol("continuation without a message"))?;
                self.append_fragment(&frame.payload)?;
                if frame.fin {
                    let message = std::mem::take(&mut self.fragment);
                    self.fragment_kind = None;
                    self.deliver(kind, &message)?;
                }
                Ok(Step::Continue)
            }
        }
    }

    fn append_fragment(&mut self, payload: &[u8]) -> Result<()> {
        if self.fragment.len() + payload.len() > self.max_message {
            return Err(Error::WsMessageTooLarge);
        }
        self.fragment.extend_from_slice(payload);
        Ok(())
    }

    fn deliver(&self, kind: MessageKind, payload: &[u8]) -> Result<()> {
        if kind == MessageKind::Text && simdutf8::basic::from_utf8(payload).is_err() {
            return Err(Error::WsProtocol("invalid utf-8 in text message"));
        }
        self.handler.on_message(&self.sender, kind, payload);
        Ok(())
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    impl WsHandler for Arc<Recorder> {
        fn on_connect(&self, _session: &WsSender) {
            self.events.lock().unwrap().push("connect".into());
        }
        fn on_message(&self, session: &WsSender, kind: MessageKind, payload: &[u8]) {
            self.events.lock().unwrap().push(format!(
                "message:{:?}:{}",
                kind,
                String::from_utf8_lossy(payload)
            ));
            if kind == MessageKind::Text {
                let _ = session.send_text(String::from_utf8_lossy(payload).to_string());
            }
        }
        fn on_close(&self, _session: &WsSender, code: u16, _reason: &[u8]) {
            self.events.lock().unwrap().push(format!("close:{code}"));
        }
        fn on_error(&self, _session: &WsSender, error: &Error) {
            self.events.lock().unwrap().push(format!("error:{error}"));
        }
    }

    fn session(recorder: Arc<Recorder>) -> (WsSession, WsSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = WsSender {
            id: 1,
            path: Arc::from("/ws"),
            tx,
        };
        let session = WsSession::new(
            Arc::new(recorder),
            sender.clone(),
            rx,
            None,
            16 << 20,
            64 << 20,
        );
        (session, sender)
    }

    async fn drive(client_frames: Vec<Vec<u8>>, recorder: Arc<Recorder>) -> Vec<u8> {
        let (session, _sender) = session(recorder);
        let (mut client, mut server) = tokio::io::duplex(1 << 20);

        let task = tokio::spawn(async move { session.run(&mut server, &[]).await });

        let mut wire = Vec::new();
        for frame in client_frames {
            client.write_all(&frame).await.unwrap();
        }
        // half-close the client so the session sees EOF after the frames
        client.shutdown().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        wire.extend_from_slice(&out);
        task.await.unwrap().unwrap();
        wire
    }

    fn masked(frame: Frame) -> Vec<u8> {
        encode_frame(&frame, Some([0x37, 0xFA, 0x21, 0x3D])).to_vec()
    }

    #[tokio::test]
    async fn echo_text() {
        let recorder = Arc::new(Recorder::default());
        let wire = drive(vec![masked(Frame::text("hi"))], recorder.clone()).await;

        let (reply, _) = frame::parse_frame(&wire, usize::MAX, false).unwrap().unwrap();
        assert!(reply.fin);
        assert_eq!(reply.opcode, OpCode::Text);
        assert_eq!(reply.payload, b"hi");

        let events = recorder.take();
        assert_eq!(events[0], "connect");
        assert_eq!(events[1], "message:Text:hi");
    }

    #[tokio::test]
    async fn ping_gets_pong_with_payload() {
        let recorder = Arc::new(Recorder::default());
        let wire = drive(vec![masked(Frame::ping(b"abc".to_vec()))], recorder).await;

        let (reply, _) = frame::parse_frame(&wire, usize::MAX, false).unwrap().unwrap();
        assert_eq!(reply.opcode, OpCode::Pong);
        assert_eq!(reply.payload, b"abc");
    }

    #[tokio::test]
    async fn close_is_echoed() {
        let recorder = Arc::new(Recorder::default());
        let wire = drive(
            vec![masked(Frame::close(close_code::NORMAL, b"done"))],
            recorder.clone(),
        )
        .await;

        let (reply, _) = frame::parse_frame(&wire, usize::MAX, false).unwrap().unwrap();
        assert_eq!(reply.opcode, OpCode::Close);
        assert_eq!(reply.close_parts().0, close_code::NORMAL);
        assert!(recorder.take().contains(&"close:1000".to_string()));
    }

    #[tokio::test]
    async fn unmasked_client_frame_closes_1002() {
        let recorder = Arc::new(Recorder::default());
        let wire = drive(
            vec![encode_frame(&Frame::text("hi"), None).to_vec()],
            recorder.clone(),
        )
        .await;

        let (reply, _) = frame::parse_frame(&wire, usize::MAX, false).unwrap().unwrap();
        assert_eq!(reply.opcode, OpCode::Close);
        assert_eq!(reply.close_parts().0, close_code::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn fragmented_message_assembles() {
        let recorder = Arc::new(Recorder::default());
        let frames = vec![
            masked(Frame {
                fin: false,
                opcode: OpCode::Text,
                payload: b"Hel".to_vec(),
            }),
            // interleaved control frame is legal mid-message
            masked(Frame::ping(b"x".to_vec())),
            masked(Frame {
                fin: true,
                opcode: OpCode::Continuation,
                payload: b"lo".to_vec(),
            }),
        ];
        let _ = drive(frames, recorder.clone()).await;

        let events = recorder.take();
        assert!(events.contains(&"message:Text:Hello".to_string()), "{events:?}");
    }

    #[tokio::test]
    async fn interleaved_data_frame_is_protocol_error() {
        let recorder = Arc::new(Recorder::default());
        let frames = vec![
            masked(Frame {
                fin: false,
                opcode: OpCode::Text,
                payload: b"part".to_vec(),
            }),
            masked(Frame::text("rogue")),
        ];
        let wire = drive(frames, recorder).await;

        let (reply, _) = frame::parse_frame(&wire, usize::MAX, false).unwrap().unwrap();
        assert_eq!(reply.opcode, OpCode::Close);
        assert_eq!(reply.close_parts().0, close_code::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn oversized_message_closes_1009() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = WsSender {
            id: 1,
            path: Arc::from("/ws"),
            tx,
        };
        let session = WsSession::new(Arc::new(recorder), sender, rx, None, 1024, 16);
        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(async move { session.run(&mut server, &[]).await });

        client
            .write_all(&masked(Frame {
                fin: false,
                opcode: OpCode::Binary,
                payload: vec![0u8; 17],
            }))
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut wire = Vec::new();
        client.read_to_end(&mut wire).await.unwrap();
        task.await.unwrap().unwrap();

        let (reply, _) = frame::parse_frame(&wire, usize::MAX, false).unwrap().unwrap();
        assert_eq!(reply.close_parts().0, close_code::MESSAGE_TOO_BIG);
    }

    #[tokio::test]
    async fn outbound_queue_preserves_order() {
        let recorder = Arc::new(Recorder::default());
        let (session, sender) = session(recorder);
        let (mut client, mut server) = tokio::io::duplex(1 << 16);

        sender.send_text("one").unwrap();
        sender.send_text("two").unwrap();
        sender.close(close_code::NORMAL, "bye").unwrap();

        let task = tokio::spawn(async move { session.run(&mut server, &[]).await });
        client.shutdown().await.unwrap();
        let mut wire = Vec::new();
        client.read_to_end(&mut wire).await.unwrap();
        task.await.unwrap().unwrap();

        let mut rest = &wire[..];
        let mut seen = Vec::new();
        while let Some((frame, consumed)) = frame::parse_frame(rest, usize::MAX, false).unwrap() {
            seen.push((frame.opcode, frame.payload));
            rest = &rest[consumed..];
            if rest.is_empty() {
                break;
            }
        }
        assert_eq!(seen[0], (OpCode::Text, b"one".to_vec()));
        assert_eq!(seen[1], (OpCode::Text, b"two".to_vec()));
        assert_eq!(seen[2].0, OpCode::Close);
    }

    #[tokio::test]
    async fn invalid_utf8_text_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let wire = drive(
            vec![masked(Frame {
                fin: true,
                opcode: OpCode::Text,
                payload: vec![0xFF, 0xFE],
            })],
            recorder,
        )
        .await;

        let (reply, _) = frame::parse_frame(&wire, usize::MAX, false).unwrap().unwrap();
        assert_eq!(reply.close_parts().0, close_code::PROTOCOL_ERROR);
    }
}
