use crate::client::Client;
use crate::protocol::{Command, Reply};
use crate::types::ResultT;

// a local command buffer; nothing touches the wire until flush submits the
// whole batch as one unit, so no other submission can interleave
pub struct Pipeline {
    client: Client,
    commands: Vec<Command>,
    tx_mode: bool,
}

impl Pipeline {
    pub(crate) fn new(client: Client, tx_mode: bool) -> Pipeline {
        Pipeline {
            client,
            commands: Vec::new(),
            tx_mode,
        }
    }

    pub fn enqueue(&mut self, cmd: Command) -> &mut Pipeline {
        self.commands.push(cmd);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn is_atomic(&self) -> bool {
        self.tx_mode
    }

    // replies come back in submission order; server-side errors stay as
    // Reply::Error entries so one bad command does not mask the rest
    pub async fn flush(self) -> ResultT<Vec<Reply>> {
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }
        self.client.submit_batch(self.commands, self.tx_mode).await
    }
}
