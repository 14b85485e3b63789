use crate::connection::{ConnectOptions, Connection};
use crate::executor::{Executor, Submission};
use crate::pipeline::Pipeline;
use crate::protocol::{Command, Reply};
use crate::pubsub::{collect_targets, PubSubSession};
use crate::types::{Error, ResultT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

const SUBMISSION_QUEUE_DEPTH: usize = 1024;
const EVENT_QUEUE_DEPTH: usize = 256;

// dials, runs the handshake and spawns the dispatch task that owns the
// connection
pub async fn connect(opts: ConnectOptions) -> ResultT<Client> {
    let conn = Connection::establish(&opts).await?;
    let (sender, rx) = mpsc::channel(SUBMISSION_QUEUE_DEPTH);
    let connected = Arc::new(AtomicBool::new(true));
    let closed = Arc::new(AtomicBool::new(false));
    let span = tracing::info_span!("dispatch", host = %opts.hostname, port = opts.port);
    let executor = Executor::new(conn, rx, opts, connected.clone(), closed.clone());
    tokio::spawn(executor.run().instrument(span));
    Ok(Client {
        sender,
        connected,
        closed,
    })
}

// clones share the same dispatch loop; concurrent callers are serialized in
// submission order and each gets exactly the reply the server produced for
// its command
#[derive(Clone)]
pub struct Client {
    sender: mpsc::Sender<Submission>,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl Client {
    // A server error reply surfaces as Error::Server, the connection stays
    // usable. Blocking commands (BLPOP and friends) park the dispatch loop
    // until the server answers, open a second connection if that hurts.
    // Dropping the future before dispatch withdraws the command; once it is
    // on the wire the exchange still runs to completion so the stream stays
    // in sync.
    pub async fn exec(&self, cmd: Command) -> ResultT<Reply> {
        match self.submit_command(cmd).await? {
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Ok(reply),
        }
    }

    pub(crate) async fn submit_command(&self, cmd: Command) -> ResultT<Reply> {
        self.ensure_open()?;
        let (done, reply) = oneshot::channel();
        self.sender
            .send(Submission::Exec { cmd, done })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        reply.await.map_err(|_| Error::ConnectionClosed)?
    }

    pub(crate) async fn submit_batch(&self, cmds: Vec<Command>, tx: bool) -> ResultT<Vec<Reply>> {
        self.ensure_open()?;
        let (done, replies) = oneshot::channel();
        self.sender
            .send(Submission::Batch { cmds, tx, done })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        replies.await.map_err(|_| Error::ConnectionClosed)?
    }

    // Best-effort submission with nobody waiting on the reply; used by the
    // subscription teardown path.
    pub(crate) fn fire_and_forget(&self, cmd: Command) {
        let (done, _ignored) = oneshot::channel();
        let _ = self.sender.try_send(Submission::Exec { cmd, done });
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.clone(), false)
    }

    // as pipeline, wrapped in MULTI / EXEC
    pub fn tx(&self) -> Pipeline {
        Pipeline::new(self.clone(), true)
    }

    // enters subscription mode; while subscribed only the subscription
    // commands and PING / QUIT are accepted, everything else is rejected
    // locally
    pub async fn subscribe<S, I>(&self, channels: I) -> ResultT<PubSubSession>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        self.open_session(false, collect_targets(channels)?).await
    }

    pub async fn psubscribe<S, I>(&self, patterns: I) -> ResultT<PubSubSession>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        self.open_session(true, collect_targets(patterns)?).await
    }

    async fn open_session(&self, pattern: bool, targets: Vec<String>) -> ResultT<PubSubSession> {
        self.ensure_open()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (done, ack) = oneshot::channel();
        self.sender
            .send(Submission::Subscribe {
                pattern,
                targets,
                events: events_tx,
                done,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        ack.await.map_err(|_| Error::ConnectionClosed)??;
        Ok(PubSubSession::new(self.clone(), events_rx))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // safe to call any number of times; pending submissions are failed with
    // a closed-connection error
    pub async fn close(&self) -> ResultT<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (done, ack) = oneshot::channel();
        if self
            .sender
            .send(Submission::Shutdown { done })
            .await
            .is_err()
        {
            // dispatch loop already gone
            return Ok(());
        }
        let _ = ack.await;
        Ok(())
    }

    fn ensure_open(&self) -> ResultT<()> {
        if self.is_closed() {
            Err(Error::mode("client is closed"))
        } else {
            Ok(())
        }
    }
}
