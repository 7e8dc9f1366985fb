use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use serde_derive::{Deserialize, Serialize};

use crate::business::{BusinessCheck, CommandProcessor};
use crate::command::{CommandStatus, ProtocolCommand};
use crate::error::{CResult, Error};
use crate::sample::SampleObject;
use crate::storage::factory::{StorableDict, StorableFactory, StorableList, StorableValue};
use crate::types::VersionId;

/// The object-kind payloads commands can introduce, tagged like commands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_ObjectType")]
pub enum ObjectPayload {
    SampleObject(SampleObject),
}

/// One revision of a shared object. Every revision carries its own unique
/// version; liveness flags track whether the command that introduced it is
/// still pending (potentially live) or has committed (actually live).
/// actually_live implies potentially_live.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedObject {
    pub version: VersionId,

    /// Versions of prior revisions this one supersedes.
    pub extends: Vec<VersionId>,

    pub potentially_live: bool,
    pub actually_live: bool,

    #[serde(flatten)]
    pub payload: ObjectPayload,
}

impl SharedObject {
    /// A brand-new revision: neither potentially nor actually live until a
    /// command introduces and commits it.
    pub fn new(version: VersionId, payload: ObjectPayload) -> Self {
        SharedObject { version, extends: vec![], potentially_live: false, actually_live: false, payload }
    }

    /// A successor revision of this object under a new version.
    pub fn new_version(&self, version: VersionId) -> Self {
        SharedObject {
            version,
            extends: vec![self.version.clone()],
            potentially_live: false,
            actually_live: false,
            payload: self.payload.clone(),
        }
    }
}

/// Sequences commands against the shared object store and tracks the
/// committed prefix. All three pieces of state -- the command sequence,
/// the object store and the commit cursor -- persist through the storable
/// factory, inside whatever write session the channel has open.
pub struct ProtocolExecutor {
    command_sequence: StorableList<ProtocolCommand>,
    object_store: StorableDict<SharedObject>,
    last_confirmed: StorableValue<u64>,
    processor: Arc<dyn CommandProcessor>,
}

impl ProtocolExecutor {
    /// Opens (or re-opens) the executor state stored under `root`, e.g.
    /// `["", my_addr, peer_addr]`.
    pub fn new(
        factory: &StorableFactory,
        root: &[&str],
        processor: Arc<dyn CommandProcessor>,
    ) -> Self {
        let mut path = root.to_vec();
        path.push("command_sequence");
        let command_sequence = factory.make_list(&path);
        path.pop();
        path.push("object_store");
        let object_store = factory.make_dict(&path);
        path.pop();
        path.push("last_confirmed");
        let last_confirmed = factory.make_value(&path, Some(0));

        ProtocolExecutor { command_sequence, object_store, last_confirmed, processor }
    }

    /// The index the next sequenced command will take.
    pub fn next_seq(&mut self) -> CResult<u64> {
        self.command_sequence.len()
    }

    /// The index of the next command awaiting a commit verdict. Everything
    /// below it has committed as success or failure.
    pub fn last_confirmed(&mut self) -> CResult<u64> {
        self.last_confirmed.get_value()
    }

    pub fn command(&mut self, seq: u64) -> CResult<ProtocolCommand> {
        self.command_sequence.get(seq)
    }

    /// The full command sequence, for inspection and tests.
    pub fn commands(&mut self) -> CResult<Vec<ProtocolCommand>> {
        let mut all = Vec::new();
        for seq in 0..self.command_sequence.len()? {
            all.push(self.command_sequence.get(seq)?);
        }
        Ok(all)
    }

    /// Attempts to sequence a command.
    ///
    /// `own` selects the liveness bar for dependencies: a command this VASP
    /// submits runs speculatively against potentially-live objects, a
    /// command from the peer runs against actually-live (committed) ones.
    ///
    /// On success the command is appended and its created objects become
    /// potentially live. On failure the command is still appended -- the
    /// failure will be committed -- unless `do_not_sequence_errors` is set,
    /// in which case the sequence is left untouched. A deferred business
    /// answer never sequences anything.
    pub fn sequence_next_command(
        &mut self,
        command: ProtocolCommand,
        own: bool,
        do_not_sequence_errors: bool,
    ) -> CResult<u64> {
        match self.check_command(&command, own) {
            Ok(created) => {
                let pos = self.command_sequence.push(&command)?;
                for mut object in created {
                    object.potentially_live = true;
                    self.object_store.insert(object.version.as_str(), &object)?;
                }
                debug!("sequenced {} at {}", command.payload.label(), pos);
                Ok(pos)
            }
            Err(Error::Deferred) => Err(Error::Deferred),
            Err(err) if do_not_sequence_errors => Err(err),
            Err(err) => {
                let pos = self.command_sequence.push(&command)?;
                debug!("sequenced {} at {} as failed: {}", command.payload.label(), pos, err);
                Err(err)
            }
        }
    }

    fn check_command(&mut self, command: &ProtocolCommand, own: bool) -> CResult<Vec<SharedObject>> {
        command.check_structure()?;

        let mut dependencies = Vec::new();
        for version in &command.depend_on {
            let object = match self.object_store.get(version.as_str()) {
                Ok(object) => object,
                Err(Error::NotFound) => {
                    return Err(Error::MissingDependency(format!("{} does not exist", version)))
                }
                Err(err) => return Err(err),
            };
            let live = if own { object.potentially_live } else { object.actually_live };
            if !live {
                return Err(Error::MissingDependency(format!("{} is not live", version)));
            }
            dependencies.push(object);
        }

        for version in &command.creates {
            if self.object_store.contains(version.as_str())? {
                return Err(Error::CommandValidation(format!("version {} already exists", version)));
            }
        }

        let context = self.processor.business_context();
        if let Err(check) = self.processor.validate(command, context.as_ref(), own) {
            return Err(match check {
                BusinessCheck::Deferred => Error::Deferred,
                other => Error::CommandValidation(other.to_string()),
            });
        }

        let mut created = Vec::new();
        for version in &command.creates {
            created.push(command.payload.object(version, &dependencies)?);
        }
        Ok(created)
    }

    /// Commits the command at `seq` as successful: its dependencies are
    /// consumed (deleted), its created objects become actually live, and
    /// the processor's success hook runs.
    pub fn set_success(&mut self, seq: u64) -> CResult<()> {
        self.check_cursor(seq)?;

        let mut command = self.command_sequence.get(seq)?;
        command.commit_status = CommandStatus::Success;
        self.command_sequence.set(seq, &command)?;

        for version in &command.depend_on {
            self.object_store.remove(version.as_str())?;
        }
        for version in &command.creates {
            let mut object = self.object_store.get(version.as_str())?;
            object.actually_live = true;
            self.object_store.insert(version.as_str(), &object)?;
        }

        self.last_confirmed.set_value(&(seq + 1))?;
        debug!("committed {} at {} as success", command.payload.label(), seq);
        self.processor.process_success(&command);
        Ok(())
    }

    /// Commits the command at `seq` as failed: its created objects are
    /// removed (they never become live; they may be absent if sequencing
    /// already failed), and the processor's failure hook runs.
    pub fn set_fail(&mut self, seq: u64, reason: &str) -> CResult<()> {
        self.check_cursor(seq)?;

        let mut command = self.command_sequence.get(seq)?;
        command.commit_status = CommandStatus::Failed;
        self.command_sequence.set(seq, &command)?;

        for version in &command.creates {
            if self.object_store.contains(version.as_str())? {
                self.object_store.remove(version.as_str())?;
            }
        }

        self.last_confirmed.set_value(&(seq + 1))?;
        debug!("committed {} at {} as failure", command.payload.label(), seq);
        self.processor.process_failure(&command, reason);
        Ok(())
    }

    fn check_cursor(&mut self, seq: u64) -> CResult<()> {
        let confirmed = self.last_confirmed.get_value()?;
        if seq != confirmed {
            return Err(Error::Internal(format!(
                "commit out of order: seq {} but cursor at {}",
                seq, confirmed
            )));
        }
        Ok(())
    }

    pub fn count_potentially_live(&mut self) -> CResult<usize> {
        Ok(self.object_store.values()?.iter().filter(|o| o.potentially_live).count())
    }

    pub fn count_actually_live(&mut self) -> CResult<usize> {
        Ok(self.object_store.values()?.iter().filter(|o| o.actually_live).count())
    }

    /// Liveness flags of every stored object, keyed by version. Used to
    /// compare two executors for convergence.
    pub fn object_liveness(&mut self) -> CResult<BTreeMap<String, (bool, bool)>> {
        let mut map = BTreeMap::new();
        for object in self.object_store.values()? {
            map.insert(
                object.version.as_str().to_string(),
                (object.potentially_live, object.actually_live),
            );
        }
        Ok(map)
    }
}
