use serde_derive::{Deserialize, Serialize};

use crate::address::Address;
use crate::business::BusinessContext;
use crate::error::{CResult, Error};
use crate::executor::SharedObject;
use crate::sample::SampleCommand;
use crate::types::VersionId;

/// Commit status of a sequenced command. Private to storage: it never
/// appears on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

impl CommandStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, CommandStatus::Pending)
    }
}

/// The command-kind payloads this protocol knows. The wire `_ObjectType`
/// tag selects the variant; adding a command kind means adding a variant
/// here and dispatching it below.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_ObjectType")]
pub enum CommandPayload {
    SampleCommand(SampleCommand),
}

impl CommandPayload {
    /// Constructs one of the objects this command introduces.
    /// `dependencies` holds the resolved objects the command consumes, for
    /// payloads that derive new revisions from them.
    pub fn object(&self, version: &VersionId, dependencies: &[SharedObject]) -> CResult<SharedObject> {
        match self {
            CommandPayload::SampleCommand(cmd) => cmd.object(version, dependencies),
        }
    }

    /// Application-level validity of the payload itself, checked through
    /// the business context.
    pub fn validate(&self, context: &dyn BusinessContext, own: bool) -> CResult<()> {
        match self {
            CommandPayload::SampleCommand(cmd) => cmd.validate(context, own),
        }
    }

    /// A short human-readable tag for logs.
    pub fn label(&self) -> String {
        match self {
            CommandPayload::SampleCommand(cmd) => format!("CMD({})", cmd.item()),
        }
    }
}

/// A protocol command: the opaque payload plus the object versions it
/// consumes and introduces. The channel inspects only `depend_on`,
/// `creates` and the commit status; everything else belongs to the
/// payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolCommand {
    #[serde(flatten)]
    pub payload: CommandPayload,

    /// Versions this command consumes. They must exist and meet the
    /// liveness bar when the command is sequenced.
    pub depend_on: Vec<VersionId>,

    /// Versions this command introduces. They must not exist yet.
    pub creates: Vec<VersionId>,

    #[serde(default)]
    pub commit_status: CommandStatus,

    /// The VASP that submitted the command. Stamped by the channel, never
    /// serialized.
    #[serde(skip)]
    pub origin: Option<Address>,
}

impl ProtocolCommand {
    pub fn new(payload: CommandPayload, depend_on: Vec<VersionId>, creates: Vec<VersionId>) -> Self {
        ProtocolCommand {
            payload,
            depend_on,
            creates,
            commit_status: CommandStatus::Pending,
            origin: None,
        }
    }

    pub fn set_origin(&mut self, origin: Address) {
        self.origin = Some(origin);
    }

    /// Structural sanity of the version sets: a command may not consume a
    /// version it introduces.
    pub fn check_structure(&self) -> CResult<()> {
        for version in &self.creates {
            if self.depend_on.contains(version) {
                return Err(Error::CommandValidation(format!(
                    "version {} is both consumed and created",
                    version
                )));
            }
        }
        Ok(())
    }

    /// Wire-level equality: same payload and same version sets. The commit
    /// status and origin are local bookkeeping and do not participate, so
    /// a retransmitted command matches its stored copy.
    pub fn is_same_command(&self, other: &ProtocolCommand) -> bool {
        self.payload == other.payload
            && self.depend_on == other.depend_on
            && self.creates == other.creates
    }
}
