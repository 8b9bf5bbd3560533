//! Seam for the in-game calendar.
//!
//! The calendar arithmetic itself lives outside this program; the proxy
//! only remembers whether an epoch has been synchronized and reports that
//! state through the `clock` command.

pub struct Clock {
    epoch: Option<u64>,
}

impl Clock {
    pub fn new() -> Self {
        Self { epoch: None }
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = Some(epoch);
    }

    pub fn time(&self) -> String {
        match self.epoch {
            Some(epoch) => format!("Clock synchronized with epoch {epoch}."),
            None => "Clock not synchronized. Look at a clock in game to synchronize it.".to_owned(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
