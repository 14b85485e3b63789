use crate::client::Client;
use crate::protocol::{Command, Reply};
use crate::types::{Error, ResultT};
use log::debug;
use tokio::sync::mpsc;

// one server-initiated push, parsed from its fixed array shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message {
        channel: String,
        payload: Vec<u8>,
    },
    PMessage {
        pattern: String,
        channel: String,
        payload: Vec<u8>,
    },
    Subscribe {
        channel: String,
        count: i64,
    },
    Unsubscribe {
        channel: String,
        count: i64,
    },
    PSubscribe {
        pattern: String,
        count: i64,
    },
    PUnsubscribe {
        pattern: String,
        count: i64,
    },
}

impl Event {
    pub(crate) fn membership_count(&self) -> Option<i64> {
        match self {
            Event::Subscribe { count, .. }
            | Event::Unsubscribe { count, .. }
            | Event::PSubscribe { count, .. }
            | Event::PUnsubscribe { count, .. } => Some(*count),
            Event::Message { .. } | Event::PMessage { .. } => None,
        }
    }

    pub(crate) fn is_confirmation(&self) -> bool {
        self.membership_count().is_some()
    }
}

// A bare UNSUBSCRIBE with nothing subscribed confirms with a nil channel;
// that surfaces as an empty name.
fn push_name(reply: &Reply) -> ResultT<String> {
    match reply {
        Reply::Bulk(b) => Ok(String::from_utf8_lossy(b).into_owned()),
        Reply::Status(s) => Ok(s.clone()),
        Reply::Nil => Ok(String::new()),
        other => Err(Error::protocol(format!(
            "push frame carries a non-string name: {:?}",
            other
        ))),
    }
}

fn push_payload(reply: &Reply) -> ResultT<Vec<u8>> {
    match reply {
        Reply::Bulk(b) => Ok(b.clone()),
        Reply::Status(s) => Ok(s.clone().into_bytes()),
        other => Err(Error::protocol(format!(
            "push frame carries a non-string payload: {:?}",
            other
        ))),
    }
}

// Ok(None) means the frame is not a push (the +PONG answering a PING) and
// belongs to a pending request instead
pub(crate) fn parse_push(reply: &Reply) -> ResultT<Option<Event>> {
    let items = match reply {
        Reply::Array(items) => items,
        _ => return Ok(None),
    };
    let tag = match items.first() {
        Some(Reply::Bulk(tag)) => tag.as_slice(),
        _ => return Err(Error::protocol(format!("untagged push frame: {:?}", reply))),
    };
    let event = match (tag, items.len()) {
        (b"message", 3) => Event::Message {
            channel: push_name(&items[1])?,
            payload: push_payload(&items[2])?,
        },
        (b"pmessage", 4) => Event::PMessage {
            pattern: push_name(&items[1])?,
            channel: push_name(&items[2])?,
            payload: push_payload(&items[3])?,
        },
        (b"subscribe", 3) => Event::Subscribe {
            channel: push_name(&items[1])?,
            count: items[2].as_integer()?,
        },
        (b"unsubscribe", 3) => Event::Unsubscribe {
            channel: push_name(&items[1])?,
            count: items[2].as_integer()?,
        },
        (b"psubscribe", 3) => Event::PSubscribe {
            pattern: push_name(&items[1])?,
            count: items[2].as_integer()?,
        },
        (b"punsubscribe", 3) => Event::PUnsubscribe {
            pattern: push_name(&items[1])?,
            count: items[2].as_integer()?,
        },
        _ => {
            return Err(Error::protocol(format!(
                "unrecognized push frame: {:?}",
                reply
            )))
        }
    };
    Ok(Some(event))
}

pub(crate) fn subscription_command(pattern: bool, targets: &[String]) -> Command {
    let name = if pattern { "PSUBSCRIBE" } else { "SUBSCRIBE" };
    Command::new(name).args(targets.iter())
}

// events arrive in server order; the stream ends once every channel and
// pattern has been unsubscribed
pub struct PubSubSession {
    client: Client,
    events: mpsc::Receiver<ResultT<Event>>,
    done: bool,
}

impl PubSubSession {
    pub(crate) fn new(client: Client, events: mpsc::Receiver<ResultT<Event>>) -> PubSubSession {
        PubSubSession {
            client,
            events,
            done: false,
        }
    }

    // Ok(None) once the subscription set is empty and the connection has
    // left subscription mode
    pub async fn next_event(&mut self) -> ResultT<Option<Event>> {
        if self.done {
            return Ok(None);
        }
        match self.events.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(err)) => {
                self.done = true;
                Err(err)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    pub async fn subscribe<S, I>(&self, channels: I) -> ResultT<()>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        self.add_subscriptions(false, collect_targets(channels)?).await
    }

    pub async fn psubscribe<S, I>(&self, patterns: I) -> ResultT<()>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        self.add_subscriptions(true, collect_targets(patterns)?).await
    }

    async fn add_subscriptions(&self, pattern: bool, targets: Vec<String>) -> ResultT<()> {
        let cmd = subscription_command(pattern, &targets);
        ack(self.client.submit_command(cmd).await?)
    }

    // an empty list drops all of them
    pub async fn unsubscribe<S, I>(&self, channels: I) -> ResultT<()>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let cmd = Command::new("UNSUBSCRIBE").args(channels.into_iter().map(Into::into));
        ack(self.client.submit_command(cmd).await?)
    }

    pub async fn punsubscribe<S, I>(&self, patterns: I) -> ResultT<()>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let cmd = Command::new("PUNSUBSCRIBE").args(patterns.into_iter().map(Into::into));
        ack(self.client.submit_command(cmd).await?)
    }

    // drops every subscription, then drains until the connection is back in
    // normal command mode
    pub async fn close(&mut self) -> ResultT<()> {
        if self.done {
            return Ok(());
        }
        let _ = self.client.submit_command(Command::new("UNSUBSCRIBE")).await;
        let _ = self
            .client
            .submit_command(Command::new("PUNSUBSCRIBE"))
            .await;
        loop {
            match self.next_event().await {
                Ok(Some(event)) => debug!("discarding event during close: {:?}", event),
                Ok(None) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }
}

impl Drop for PubSubSession {
    fn drop(&mut self) {
        if !self.done {
            // best effort, close() is the reliable path
            self.client.fire_and_forget(Command::new("UNSUBSCRIBE"));
            self.client.fire_and_forget(Command::new("PUNSUBSCRIBE"));
        }
    }
}

fn ack(reply: Reply) -> ResultT<()> {
    match reply {
        Reply::Error(msg) => Err(Error::Server(msg)),
        _ => Ok(()),
    }
}

pub(crate) fn collect_targets<S, I>(targets: I) -> ResultT<Vec<String>>
where
    S: Into<String>,
    I: IntoIterator<Item = S>,
{
    let targets: Vec<String> = targets.into_iter().map(Into::into).collect();
    if targets.is_empty() {
        return Err(Error::InvalidArgument(
            "at least one channel or pattern is required".into(),
        ));
    }
    Ok(targets)
}
