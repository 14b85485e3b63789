use crate::connection::{ConnectOptions, Connection};
use crate::protocol::{Command, Reply};
use crate::pubsub::{parse_push, subscription_command, Event};
use crate::types::{Error, ResultT};
use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

pub(crate) enum Submission {
    Exec {
        cmd: Command,
        done: oneshot::Sender<ResultT<Reply>>,
    },
    Batch {
        cmds: Vec<Command>,
        tx: bool,
        done: oneshot::Sender<ResultT<Vec<Reply>>>,
    },
    Subscribe {
        pattern: bool,
        targets: Vec<String>,
        events: mpsc::Sender<ResultT<Event>>,
        done: oneshot::Sender<ResultT<()>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    PubSub,
    Closed,
}

enum PubSubExit {
    // everything unsubscribed, back to normal dispatch
    Resume,
    // the wire is no longer trustworthy
    Fatal,
    Shutdown,
}

// what a command admitted in subscription mode is waiting for
enum Expect {
    Confirmation,
    NonPush,
}

enum Step {
    Frame(ResultT<Reply>),
    Sub(Option<Submission>),
}

// owns the connection, drains submissions FIFO with at most one exchange in
// flight; that alone is what pairs reply k with request k
pub(crate) struct Executor {
    conn: Connection,
    rx: mpsc::Receiver<Submission>,
    opts: ConnectOptions,
    mode: Mode,
    retry_count: u32,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl Executor {
    pub(crate) fn new(
        conn: Connection,
        rx: mpsc::Receiver<Submission>,
        opts: ConnectOptions,
        connected: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    ) -> Executor {
        Executor {
            conn,
            rx,
            opts,
            mode: Mode::Normal,
            retry_count: 0,
            connected,
            closed,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(
            "dispatch loop started for {}:{}",
            self.opts.hostname, self.opts.port
        );
        loop {
            let sub = match self.rx.recv().await {
                Some(sub) => sub,
                None => break,
            };
            match sub {
                Submission::Exec { cmd, done } => {
                    if done.is_closed() {
                        // caller went away before dispatch, never touches the wire
                        debug!("dropping abandoned submission {}", name_of(&cmd));
                        continue;
                    }
                    if let Some(err) = self.admission_error(&cmd) {
                        let _ = done.send(Err(err));
                        continue;
                    }
                    let result = self.exec_with_retry(&cmd).await;
                    let fatal = is_fatal(result.as_ref().err());
                    let _ = done.send(result);
                    if fatal {
                        break;
                    }
                }
                Submission::Batch { cmds, tx, done } => {
                    if done.is_closed() {
                        continue;
                    }
                    let result = self.batch_with_retry(&cmds, tx).await;
                    let fatal = is_fatal(result.as_ref().err());
                    let _ = done.send(result);
                    if fatal {
                        break;
                    }
                }
                Submission::Subscribe {
                    pattern,
                    targets,
                    events,
                    done,
                } => match self.enter_pubsub(pattern, &targets, events, done).await {
                    PubSubExit::Resume => {
                        self.mode = Mode::Normal;
                    }
                    PubSubExit::Fatal | PubSubExit::Shutdown => break,
                },
                Submission::Shutdown { done } => {
                    let _ = done.send(());
                    break;
                }
            }
        }
        self.teardown().await;
    }

    // Subscription state lives with the subscription loop; entering it any
    // other way would desynchronize the stream.
    fn admission_error(&self, cmd: &Command) -> Option<Error> {
        let subscription = ["SUBSCRIBE", "PSUBSCRIBE", "UNSUBSCRIBE", "PUNSUBSCRIBE"]
            .iter()
            .any(|name| cmd.is_named(name));
        if subscription {
            return Some(Error::mode(format!(
                "{} must go through subscribe()/psubscribe()",
                name_of(cmd)
            )));
        }
        None
    }

    async fn exec_with_retry(&mut self, cmd: &Command) -> ResultT<Reply> {
        match self.conn.exchange(cmd).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                if err.is_transport() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                if !self.should_retry(&err) {
                    return Err(err);
                }
                warn!("exchange failed ({}), reconnecting", err);
                self.reconnect().await?;
                // the failed command is re-submitted exactly once
                self.conn.exchange(cmd).await
            }
        }
    }

    async fn batch_with_retry(&mut self, cmds: &[Command], tx: bool) -> ResultT<Vec<Reply>> {
        match self.run_batch(cmds, tx).await {
            Ok(replies) => Ok(replies),
            Err(err) => {
                if err.is_transport() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                if !self.should_retry(&err) {
                    return Err(err);
                }
                warn!("batch failed ({}), reconnecting", err);
                self.reconnect().await?;
                self.run_batch(cmds, tx).await
            }
        }
    }

    fn should_retry(&self, err: &Error) -> bool {
        err.is_transport() && self.opts.max_retry_count > 0
    }

    async fn run_batch(&mut self, cmds: &[Command], tx: bool) -> ResultT<Vec<Reply>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        if tx {
            self.run_transaction(cmds).await
        } else {
            self.run_pipeline(cmds).await
        }
    }

    // whole batch in one flush, then exactly one reply per command
    async fn run_pipeline(&mut self, cmds: &[Command]) -> ResultT<Vec<Reply>> {
        let last = cmds.len() - 1;
        for (idx, cmd) in cmds.iter().enumerate() {
            self.conn.writer.write_command(cmd, idx == last).await?;
        }
        let mut replies = Vec::with_capacity(cmds.len());
        for _ in cmds {
            replies.push(self.conn.reader.read_reply().await?);
        }
        Ok(replies)
    }

    // one ack for MULTI, one +QUEUED (or error) per command, then the EXEC
    // result array
    async fn run_transaction(&mut self, cmds: &[Command]) -> ResultT<Vec<Reply>> {
        let discard_at = cmds.iter().position(|c| c.is_named("DISCARD"));
        let body = match discard_at {
            // everything after an explicit DISCARD is dead, EXEC is not sent
            Some(idx) => &cmds[..=idx],
            None => cmds,
        };
        self.conn
            .writer
            .write_command(&Command::new("MULTI"), false)
            .await?;
        for cmd in body {
            self.conn.writer.write_command(cmd, false).await?;
        }
        if discard_at.is_none() {
            self.conn
                .writer
                .write_command(&Command::new("EXEC"), true)
                .await?;
        } else {
            self.conn.writer.flush().await?;
        }

        match self.conn.reader.read_reply().await? {
            Reply::Status(_) => (),
            other => {
                return Err(Error::protocol(format!(
                    "MULTI not acknowledged: {:?}",
                    other
                )))
            }
        }
        let mut queued = Vec::with_capacity(body.len());
        for _ in body {
            queued.push(self.conn.reader.read_reply().await?);
        }
        if discard_at.is_some() {
            let ack = queued
                .pop()
                .ok_or_else(|| Error::protocol("missing DISCARD acknowledgement"))?;
            return Ok(vec![ack]);
        }
        match self.conn.reader.read_reply().await? {
            Reply::Array(replies) => Ok(replies),
            // EXEC refused or aborted: hand back the queueing-phase replies
            // so the caller sees which command was rejected
            Reply::Error(_) | Reply::Nil => Ok(queued),
            other => Err(Error::protocol(format!(
                "unexpected EXEC reply: {:?}",
                other
            ))),
        }
    }

    // probe first, then a fixed-interval dial loop bounded by
    // max_retry_count; the counter resets on every success
    async fn reconnect(&mut self) -> ResultT<()> {
        if self.mode == Mode::PubSub {
            // subscriptions are not restorable, the caller must re-subscribe
            return Err(Error::mode(
                "connection lost while subscribed, re-subscribe on a new session",
            ));
        }
        if self.conn.probe().await {
            info!("connection probe succeeded, resuming");
            self.retry_count = 0;
            self.connected.store(true, Ordering::SeqCst);
            return Ok(());
        }
        self.conn.shutdown().await;
        loop {
            self.retry_count += 1;
            if self.retry_count > self.opts.max_retry_count {
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    format!(
                        "reconnect abandoned after {} attempts",
                        self.opts.max_retry_count
                    ),
                )));
            }
            sleep(self.opts.retry_interval).await;
            match Connection::establish(&self.opts).await {
                Ok(conn) => {
                    info!("reconnected to {}:{}", self.opts.hostname, self.opts.port);
                    self.conn = conn;
                    self.retry_count = 0;
                    self.connected.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(err) => {
                    warn!("reconnect attempt {} failed: {}", self.retry_count, err);
                }
            }
        }
    }

    async fn enter_pubsub(
        &mut self,
        pattern: bool,
        targets: &[String],
        events: mpsc::Sender<ResultT<Event>>,
        done: oneshot::Sender<ResultT<()>>,
    ) -> PubSubExit {
        let cmd = subscription_command(pattern, targets);
        if let Err(err) = self.conn.writer.write_command(&cmd, true).await {
            let _ = done.send(Err(err));
            return PubSubExit::Fatal;
        }
        self.mode = Mode::PubSub;
        info!("entered subscription mode");
        let _ = done.send(Ok(()));
        self.pubsub_loop(events).await
    }

    // server pushes flow to the event sink while the submission channel
    // stays open for the restricted command set
    async fn pubsub_loop(&mut self, events: mpsc::Sender<ResultT<Event>>) -> PubSubExit {
        let mut channels: HashSet<String> = HashSet::new();
        let mut patterns: HashSet<String> = HashSet::new();
        let mut pending: VecDeque<(Expect, oneshot::Sender<ResultT<Reply>>)> = VecDeque::new();
        let mut remaining: Option<i64> = None;
        let mut draining = false;

        loop {
            let step = tokio::select! {
                reply = self.conn.reader.read_reply() => Step::Frame(reply),
                sub = self.rx.recv() => Step::Sub(sub),
            };
            match step {
                Step::Frame(Err(err)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    warn!("subscription stream failed: {}", err);
                    fail_pending(&mut pending, &err);
                    let _ = events.send(Err(err)).await;
                    return PubSubExit::Fatal;
                }
                Step::Frame(Ok(reply)) => {
                    let event = match parse_push(&reply) {
                        Ok(event) => event,
                        Err(err) => {
                            fail_pending(&mut pending, &err);
                            let _ = events.send(Err(err)).await;
                            return PubSubExit::Fatal;
                        }
                    };
                    match event {
                        Some(event) => {
                            match &event {
                                Event::Subscribe { channel, .. } => {
                                    channels.insert(channel.clone());
                                }
                                Event::Unsubscribe { channel, .. } => {
                                    channels.remove(channel);
                                }
                                Event::PSubscribe { pattern, .. } => {
                                    patterns.insert(pattern.clone());
                                }
                                Event::PUnsubscribe { pattern, .. } => {
                                    patterns.remove(pattern);
                                }
                                Event::Message { .. } | Event::PMessage { .. } => (),
                            }
                            if event.is_confirmation() {
                                remaining = event.membership_count();
                                debug!(
                                    "membership now {} channels, {} patterns, {:?} total",
                                    channels.len(),
                                    patterns.len(),
                                    remaining
                                );
                                // a confirmation doubles as the reply to the
                                // oldest (p)subscribe / (p)unsubscribe in flight.
                                // TODO pair multi-channel confirmations with
                                // their command instead of first-wins
                                if matches!(pending.front(), Some((Expect::Confirmation, _))) {
                                    if let Some((_, done)) = pending.pop_front() {
                                        let _ = done.send(Ok(reply.clone()));
                                    }
                                }
                            }
                            if !draining && events.send(Ok(event)).await.is_err() {
                                // the session was dropped without unsubscribing
                                debug!("event sink gone, unsubscribing everything");
                                draining = true;
                                let unsub = Command::new("UNSUBSCRIBE");
                                let punsub = Command::new("PUNSUBSCRIBE");
                                if self.conn.writer.write_command(&unsub, false).await.is_err()
                                    || self.conn.writer.write_command(&punsub, true).await.is_err()
                                {
                                    fail_pending(&mut pending, &Error::ConnectionClosed);
                                    return PubSubExit::Fatal;
                                }
                            }
                            if remaining == Some(0) && pending.is_empty() {
                                info!("subscription set empty, back to normal dispatch");
                                return PubSubExit::Resume;
                            }
                        }
                        None => {
                            // non-push frame: belongs to the oldest command in
                            // flight (PING/QUIT, or a rejected subscription)
                            match pending.pop_front() {
                                Some((_, done)) if matches!(reply, Reply::Error(_)) => {
                                    let _ = done.send(Ok(reply));
                                }
                                Some((Expect::NonPush, done)) => {
                                    let _ = done.send(Ok(reply));
                                }
                                Some((Expect::Confirmation, done)) => {
                                    let err =
                                        Error::protocol(format!("expected a membership confirmation, got {:?}", reply));
                                    let _ = done.send(Err(err.duplicate()));
                                    fail_pending(&mut pending, &err);
                                    let _ = events.send(Err(err)).await;
                                    return PubSubExit::Fatal;
                                }
                                None => {
                                    let err = Error::protocol(format!(
                                        "unsolicited non-push frame while subscribed: {:?}",
                                        reply
                                    ));
                                    let _ = events.send(Err(err)).await;
                                    return PubSubExit::Fatal;
                                }
                            }
                            if remaining == Some(0) && pending.is_empty() {
                                return PubSubExit::Resume;
                            }
                        }
                    }
                }
                Step::Sub(None) => {
                    debug!("client handle dropped while subscribed");
                    return PubSubExit::Shutdown;
                }
                Step::Sub(Some(Submission::Exec { cmd, done })) => {
                    match pubsub_admission(&cmd) {
                        Admission::Control => {
                            if let Err(err) = self.conn.writer.write_command(&cmd, true).await {
                                let _ = done.send(Err(err.duplicate()));
                                fail_pending(&mut pending, &err);
                                let _ = events.send(Err(err)).await;
                                return PubSubExit::Fatal;
                            }
                            pending.push_back((Expect::Confirmation, done));
                        }
                        Admission::Request => {
                            if let Err(err) = self.conn.writer.write_command(&cmd, true).await {
                                let _ = done.send(Err(err.duplicate()));
                                fail_pending(&mut pending, &err);
                                let _ = events.send(Err(err)).await;
                                return PubSubExit::Fatal;
                            }
                            pending.push_back((Expect::NonPush, done));
                        }
                        Admission::Rejected => {
                            let _ = done.send(Err(Error::mode(format!(
                                "{} is not allowed while subscribed",
                                name_of(&cmd)
                            ))));
                        }
                    }
                }
                Step::Sub(Some(Submission::Batch { done, .. })) => {
                    let _ = done.send(Err(Error::mode("pipelines are not allowed while subscribed")));
                }
                Step::Sub(Some(Submission::Subscribe { done, .. })) => {
                    let _ = done.send(Err(Error::mode("already subscribed on this connection")));
                }
                Step::Sub(Some(Submission::Shutdown { done })) => {
                    let _ = done.send(());
                    return PubSubExit::Shutdown;
                }
            }
        }
    }

    async fn teardown(&mut self) {
        self.mode = Mode::Closed;
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.conn.shutdown().await;
        self.rx.close();
        // everyone still queued learns the connection is gone
        while let Ok(sub) = self.rx.try_recv() {
            reject(sub);
        }
        debug!("dispatch loop stopped");
    }
}

enum Admission {
    // changes the membership sets, answered by a confirmation push
    Control,
    // allowed, answered by an ordinary reply
    Request,
    Rejected,
}

fn pubsub_admission(cmd: &Command) -> Admission {
    let control = ["SUBSCRIBE", "UNSUBSCRIBE", "PSUBSCRIBE", "PUNSUBSCRIBE"]
        .iter()
        .any(|name| cmd.is_named(name));
    if control {
        Admission::Control
    } else if cmd.is_named("PING") || cmd.is_named("QUIT") {
        Admission::Request
    } else {
        Admission::Rejected
    }
}

fn is_fatal(err: Option<&Error>) -> bool {
    matches!(
        err,
        Some(Error::Protocol(_)) | Some(Error::Transport(_)) | Some(Error::ConnectionClosed)
    )
}

fn fail_pending(pending: &mut VecDeque<(Expect, oneshot::Sender<ResultT<Reply>>)>, err: &Error) {
    while let Some((_, done)) = pending.pop_front() {
        let _ = done.send(Err(err.duplicate()));
    }
}

fn reject(sub: Submission) {
    match sub {
        Submission::Exec { done, .. } => {
            let _ = done.send(Err(Error::ConnectionClosed));
        }
        Submission::Batch { done, .. } => {
            let _ = done.send(Err(Error::ConnectionClosed));
        }
        Submission::Subscribe { done, .. } => {
            let _ = done.send(Err(Error::ConnectionClosed));
        }
        Submission::Shutdown { done } => {
            let _ = done.send(());
        }
    }
}

fn name_of(cmd: &Command) -> String {
    String::from_utf8_lossy(cmd.name()).into_owned()
}
