use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cm::{self, ClientMachine};
use crate::config::EchoConfig;
use crate::context::TransportSlot;
use crate::echo::{message, ClientEvent, ClientHandler};
use crate::error::{Error, ProviderResultExt, Result};
use crate::peer::PeerConnection;
use crate::poller::CompletionHandler;
use crate::provider::Cm;

/// Input that ends the session.
pub const EXIT_SENTINEL: &str = "exit";

/// How often an idle session checks whether the server went away.
const CLOSE_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// An echoed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The received buffer.
    pub bytes: Vec<u8>,
    /// From posting the send to observing both completions.
    pub rtt: Duration,
}

impl Reply {
    /// The reply's text, up to the first NUL.
    pub fn text(&self) -> Cow<'_, str> {
        message::text(&self.bytes)
    }
}

/// Totals of a finished client session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientSummary {
    pub sent: usize,
    pub received: usize,
}

/// The initiating side of the echo service.
pub struct EchoClient<P: Cm> {
    provider: P,
    config: EchoConfig,
}

impl<P: Cm> EchoClient<P> {
    pub fn new(provider: P, config: EchoConfig) -> Self {
        Self { provider, config }
    }

    /// Connect to `server`, send every message read from `input` and
    /// forward each reply to `replies`.
    ///
    /// The session ends at [`EXIT_SENTINEL`] or when `input` closes, after
    /// which the client disconnects and returns once the connection is torn
    /// down.
    pub fn run(
        &self,
        server: SocketAddr,
        input: Receiver<String>,
        replies: Sender<Reply>,
    ) -> Result<ClientSummary> {
        let provider = &self.provider;
        let channel = provider
            .create_event_channel()
            .during("rdma_create_event_channel")?;
        let id = provider.create_id(&channel).during("rdma_create_id")?;

        let (events_tx, events) = mpsc::channel();
        let handler: Arc<dyn CompletionHandler<P>> = Arc::new(ClientHandler::new(events_tx));
        let slot = Arc::new(TransportSlot::new(
            provider.clone(),
            self.config.cq_depth,
            self.config.qp,
        ));
        let (established_tx, established) = mpsc::channel();
        let mut machine = ClientMachine::new(
            slot,
            handler,
            self.config.conn,
            self.config.timeout(),
            established_tx,
        );
        machine.start(&id, server)?;

        let session = Session {
            provider: provider.clone(),
            established,
            events,
            input,
            replies,
            local_close: machine.local_close(),
        };
        let session = thread::Builder::new()
            .name("echo-session".to_owned())
            .spawn(move || session.run())
            .during("spawn client session")?;

        let ret = cm::event_loop(provider, &channel, |event| machine.handle(event));
        // Closes the session's `established` channel if we never got there.
        drop(machine);
        ret?;

        let summary = match session.join() {
            Ok(summary) => summary?,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        provider.destroy_event_channel(channel);
        log::info!("sent {} messages, received {} replies", summary.sent, summary.received);
        Ok(summary)
    }
}

struct Session<P: Cm> {
    provider: P,
    established: Receiver<Arc<PeerConnection<P>>>,
    events: Receiver<ClientEvent>,
    input: Receiver<String>,
    replies: Sender<Reply>,
    local_close: Arc<std::sync::atomic::AtomicBool>,
}

impl<P: Cm> Session<P> {
    fn run(self) -> Result<ClientSummary> {
        let mut summary = ClientSummary::default();
        let Ok(conn) = self.established.recv() else {
            return Ok(summary);
        };

        loop {
            let msg = match self.input.recv_timeout(CLOSE_CHECK_INTERVAL) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => {
                    // Torn down by the CM loop on a remote disconnect.
                    if conn.is_destroyed() {
                        log::info!("server closed the connection");
                        return Ok(summary);
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if msg == EXIT_SENTINEL {
                break;
            }
            match self.echo(&conn, &msg) {
                Ok(reply) => {
                    summary.sent += 1;
                    summary.received += 1;
                    let _ = self.replies.send(reply);
                }
                Err(Error::Destroyed(_)) | Err(Error::Completion(_)) => {
                    log::info!("server closed the connection");
                    return Ok(summary);
                }
                Err(e) => return Err(e),
            }
        }

        if conn.is_destroyed() {
            return Ok(summary);
        }
        self.local_close.store(true, Ordering::Release);
        self.provider
            .disconnect(conn.endpoint())
            .during("rdma_disconnect")?;
        Ok(summary)
    }

    /// Send one message and wait for both its send completion and the reply.
    fn echo(&self, conn: &PeerConnection<P>, msg: &str) -> Result<Reply> {
        let start = quanta::Instant::now();
        conn.with_buffers(|bufs| message::fill(bufs.send, msg.as_bytes()))?;
        conn.post_send()?;
        conn.post_recv()?;

        let (mut sent, mut reply) = (false, None);
        while !sent || reply.is_none() {
            match self.events.recv() {
                Ok(ClientEvent::Sent(_)) => sent = true,
                Ok(ClientEvent::Received(_, bytes)) => reply = Some(bytes),
                Ok(ClientEvent::Failed(_, status)) => return Err(status.into()),
                Err(_) => return Err(Error::Destroyed(conn.id())),
            }
        }
        Ok(Reply {
            bytes: reply.unwrap_or_default(),
            rtt: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Instant;

    use super::*;
    use crate::echo::{message::BUFFER_SIZE, ServerStats};
    use crate::provider::sim::SimProvider;
    use crate::server::EchoServer;

    const ADDR: &str = "127.0.0.1:20079";

    fn start_server(provider: &SimProvider) -> (SocketAddr, Arc<ServerStats>) {
        let server = EchoServer::bind(provider.clone(), &EchoConfig::default(), ADDR.parse().unwrap())
            .unwrap();
        let addr = server.local_addr().unwrap();
        let stats = server.stats();
        thread::spawn(move || server.serve());
        (addr, stats)
    }

    /// Run a client over `messages`, returning its replies.
    fn echo_all(
        provider: &SimProvider,
        addr: SocketAddr,
        messages: &[&str],
    ) -> (ClientSummary, Vec<Reply>) {
        let (input_tx, input) = mpsc::channel();
        for msg in messages {
            input_tx.send(msg.to_string()).unwrap();
        }
        drop(input_tx);

        let (replies_tx, replies) = mpsc::channel();
        let client = EchoClient::new(provider.clone(), EchoConfig::default());
        let summary = client.run(addr, input, replies_tx).unwrap();
        (summary, replies.into_iter().collect())
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn ping() {
        let provider = SimProvider::new();
        let (addr, stats) = start_server(&provider);
        assert_eq!(addr, ADDR.parse::<SocketAddr>().unwrap());

        let (summary, replies) = echo_all(&provider, addr, &["ping", EXIT_SENTINEL, "unsent"]);
        assert_eq!(summary, ClientSummary { sent: 1, received: 1 });
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text(), "ping");
        assert_eq!(replies[0].bytes.len(), BUFFER_SIZE);
        assert!(replies[0].bytes[4..].iter().all(|&b| b == 0));

        wait_until("server teardown", || stats.closed() == 1);
        assert_eq!(stats.accepted(), 1);
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.echoed(), 1);
        assert_eq!(provider.registered_mrs(), 0);
        assert_eq!(provider.unacked_events(), 0);
    }

    #[test]
    fn sequential_clients() {
        let provider = SimProvider::new();
        let (addr, stats) = start_server(&provider);

        let (_, first) = echo_all(&provider, addr, &["alpha", "beta"]);
        let (_, second) = echo_all(&provider, addr, &["gamma"]);
        assert_eq!(
            first.iter().map(|r| r.text().into_owned()).collect::<Vec<_>>(),
            ["alpha", "beta"]
        );
        assert_eq!(second[0].text(), "gamma");

        wait_until("both teardowns", || stats.closed() == 2);
        let (summary, third) = echo_all(&provider, addr, &["delta"]);
        assert_eq!(summary.received, 1);
        assert_eq!(third[0].text(), "delta");

        wait_until("third teardown", || stats.closed() == 3);
        assert_eq!(stats.accepted(), 3);
        assert_eq!(stats.echoed(), 4);
    }

    #[test]
    fn exact_fill_echoes_byte_for_byte() {
        let provider = SimProvider::new();
        let (addr, _) = start_server(&provider);

        let msg: String = (0..BUFFER_SIZE)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect();
        let (_, replies) = echo_all(&provider, addr, &[&msg]);
        assert_eq!(replies[0].bytes, msg.as_bytes());
        assert_eq!(replies[0].text(), msg);

        let longer = format!("{}tail", msg);
        let (_, replies) = echo_all(&provider, addr, &[&longer]);
        assert_eq!(replies[0].bytes, msg.as_bytes());
    }

    #[test]
    fn empty_message_completes() {
        let provider = SimProvider::new();
        let (addr, stats) = start_server(&provider);

        let (summary, replies) = echo_all(&provider, addr, &["", "after"]);
        assert_eq!(summary, ClientSummary { sent: 2, received: 2 });
        assert_eq!(replies[0].text(), "");
        assert!(replies[0].bytes.iter().all(|&b| b == 0));
        assert_eq!(replies[1].text(), "after");
        assert_eq!(stats.echoed(), 2);
    }

    #[test]
    fn strict_alternation() {
        let provider = SimProvider::new();
        let (addr, _) = start_server(&provider);
        let config = EchoConfig::default();
        let slot = Arc::new(TransportSlot::new(provider.clone(), config.cq_depth, config.qp));

        let channel = provider.create_event_channel().unwrap();
        let id = provider.create_id(&channel).unwrap();
        let (events_tx, events) = mpsc::channel();
        let (established_tx, established) = mpsc::channel();
        let mut machine = ClientMachine::new(
            slot,
            Arc::new(ClientHandler::new(events_tx)),
            config.conn,
            config.timeout(),
            established_tx,
        );
        machine.start(&id, addr).unwrap();
        let cm_loop = thread::spawn(move || {
            cm::event_loop(&provider, &channel, |event| machine.handle(event)).unwrap();
        });

        let conn = established.recv().unwrap();
        const N: usize = 16;
        for i in 0..N {
            let msg = format!("message {}", i);
            conn.with_buffers(|bufs| message::fill(bufs.send, msg.as_bytes()))
                .unwrap();
            conn.post_send().unwrap();
            conn.post_recv().unwrap();

            let first = events.recv_timeout(Duration::from_secs(5)).unwrap();
            let second = events.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(first, ClientEvent::Sent(conn.id()));
            match second {
                ClientEvent::Received(id, bytes) => {
                    assert_eq!(id, conn.id());
                    assert_eq!(message::text(&bytes), msg);
                }
                other => panic!("expected a reply, got {:?}", other),
            }
        }

        let provider = conn.context().provider().clone();
        provider.disconnect(conn.endpoint()).unwrap();
        cm_loop.join().unwrap();
        assert!(conn.is_destroyed());
    }

    #[test]
    fn remote_close_ends_idle_session() {
        use crate::cm::{CmEventKind, ConnParam};
        use crate::provider::Verbs;
        use crate::rdma::qp::QpCaps;

        let provider = SimProvider::new();
        let addr: SocketAddr = "127.0.0.1:20080".parse().unwrap();
        let channel = provider.create_event_channel().unwrap();
        let listener = provider.create_id(&channel).unwrap();
        provider.bind_addr(&listener, addr).unwrap();
        provider.listen(&listener, 1).unwrap();
        let next = |provider: &SimProvider| {
            let record = provider.get_cm_event(&channel).unwrap();
            let event = provider.event_payload(&record);
            provider.ack_cm_event(record).unwrap();
            event
        };

        // Stays open: the session must not wait for more input.
        let (input_tx, input) = mpsc::channel::<String>();
        let (replies_tx, _replies) = mpsc::channel();
        let (done_tx, done) = mpsc::channel();
        let client = EchoClient::new(provider.clone(), EchoConfig::default());
        thread::spawn(move || {
            let _ = done_tx.send(client.run(addr, input, replies_tx));
        });

        let request = next(&provider);
        assert_eq!(request.kind, CmEventKind::ConnectRequest);
        let dev = provider.device(&request.id).unwrap();
        let pd = provider.alloc_pd(&dev).unwrap();
        let comp = provider.create_comp_channel(&dev).unwrap();
        let cq = provider.create_cq(&dev, 10, &comp).unwrap();
        let qp = provider
            .create_qp(&request.id, &pd, &cq, &QpCaps::default())
            .unwrap();
        provider.accept(&request.id, &ConnParam::default()).unwrap();
        assert_eq!(next(&provider).kind, CmEventKind::Established);

        provider.disconnect(&request.id).unwrap();
        let summary = done
            .recv_timeout(Duration::from_secs(3))
            .expect("client still running after the server disconnected")
            .unwrap();
        assert_eq!(summary, ClientSummary::default());
        assert_eq!(next(&provider).kind, CmEventKind::Disconnected);

        provider.destroy_qp(&request.id, qp);
        provider.destroy_id(&request.id).unwrap();
        drop(input_tx);
    }
}
