use nix::unistd::Pid;

use super::user_proc::UserProc;
use crate::error::{Result, StarterError};

/// The job processes of this starter, with a cursor on the one the current
/// action works on.
#[derive(Debug, Default)]
pub struct ProcessList {
    procs: Vec<UserProc>,
    current: Option<usize>,
}

impl ProcessList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `proc` and makes it current.
    pub fn push(&mut self, proc: UserProc) {
        self.procs.push(proc);
        self.current = Some(self.procs.len() - 1);
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn current(&self) -> Result<&UserProc> {
        self.current
            .and_then(|i| self.procs.get(i))
            .ok_or(StarterError::NoCurrentProc)
    }

    pub fn current_mut(&mut self) -> Result<&mut UserProc> {
        self.current
            .and_then(|i| self.procs.get_mut(i))
            .ok_or(StarterError::NoCurrentProc)
    }

    pub fn select(&mut self, index: usize) {
        self.current = (index < self.procs.len()).then_some(index);
    }

    /// Index of the process with OS pid `pid`.
    pub fn position_of(&self, pid: Pid) -> Option<usize> {
        self.procs.iter().position(|p| p.pid() == Some(pid))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut UserProc> {
        self.procs.get_mut(index)
    }

    /// Takes the current process out of the list and clears the cursor.
    pub fn remove_current(&mut self) -> Result<UserProc> {
        let index = self
            .current
            .take()
            .filter(|&i| i < self.procs.len())
            .ok_or(StarterError::NoCurrentProc)?;
        Ok(self.procs.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserProc> {
        self.procs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UserProc> {
        self.procs.iter_mut()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = UserProc> + '_ {
        self.current = None;
        self.procs.drain(..)
    }
}
