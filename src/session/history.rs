use crate::protocol::Packet;

/// Session-state commands already sent to every backend, replayed on
/// backends that join the session later
#[derive(Debug, Clone)]
pub struct SessionHistory {
    commands: Vec<Packet>,
    /// Zero means unlimited
    limit: usize,
    disabled: bool,
}

impl SessionHistory {
    pub fn new(limit: usize, disabled: bool) -> Self {
        Self {
            commands: Vec::new(),
            limit,
            disabled,
        }
    }

    /// Append a command. Fails with the limit once it is reached; with
    /// history disabled nothing is kept and nothing fails.
    pub fn record(&mut self, packet: &Packet) -> Result<(), usize> {
        if self.disabled {
            return Ok(());
        }
        if self.limit > 0 && self.commands.len() >= self.limit {
            return Err(self.limit);
        }
        self.commands.push(Packet::new(0, packet.payload.clone()));
        Ok(())
    }

    pub fn commands(&self) -> &[Packet] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
