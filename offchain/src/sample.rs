//! A minimal command kind: each command introduces a single object whose
//! version equals its item string. Tests and examples drive the protocol
//! with it, and SampleProcessor is the reference CommandProcessor.

use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::address::Address;
use crate::business::{
    BusinessCheck, BusinessContext, BusinessResult, CommandProcessor, KycLevel,
};
use crate::command::{CommandPayload, ProtocolCommand};
use crate::error::{CResult, Error};
use crate::executor::{ObjectPayload, SharedObject};
use crate::types::VersionId;

/// The object a sample command introduces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleObject {
    pub item: String,
}

/// A sample command payload. `always_happy` lets tests inject validation
/// failures: unhappy commands fail the peer-side validity check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCommand {
    item: String,

    #[serde(default = "default_happy")]
    always_happy: bool,
}

fn default_happy() -> bool {
    true
}

impl SampleCommand {
    /// Builds the full protocol command for an item: it creates the
    /// version named after the item and consumes the given dependencies.
    pub fn make(item: &str, depend_on: Vec<&str>) -> ProtocolCommand {
        Self::make_with_mood(item, depend_on, true)
    }

    /// Like make(), but lets tests produce commands that fail validation.
    pub fn make_with_mood(item: &str, depend_on: Vec<&str>, always_happy: bool) -> ProtocolCommand {
        let payload =
            CommandPayload::SampleCommand(SampleCommand { item: item.to_string(), always_happy });
        let depend_on = depend_on.into_iter().map(VersionId::from).collect();
        let creates = vec![VersionId::from(item)];
        ProtocolCommand::new(payload, depend_on, creates)
    }

    pub fn item(&self) -> &str {
        &self.item
    }

    pub(crate) fn object(
        &self,
        version: &VersionId,
        _dependencies: &[SharedObject],
    ) -> CResult<SharedObject> {
        if version.as_str() != self.item {
            return Err(Error::Internal(format!(
                "sample command for {} cannot construct version {}",
                self.item, version
            )));
        }
        Ok(SharedObject::new(
            version.clone(),
            ObjectPayload::SampleObject(SampleObject { item: self.item.clone() }),
        ))
    }

    pub(crate) fn validate(&self, _context: &dyn BusinessContext, own: bool) -> CResult<()> {
        // Own commands are always accepted speculatively; unhappy commands
        // fail the authoritative peer-side check.
        if !own && !self.always_happy {
            return Err(Error::CommandValidation(format!("{} rejected", self.item)));
        }
        Ok(())
    }
}

/// A permissive business environment for tests and examples: single
/// account, no KYC to exchange, everything settles.
pub struct SampleContext;

impl BusinessContext for SampleContext {
    fn open_channel_to(&self, _peer: &Address) -> BusinessResult<()> {
        Ok(())
    }

    fn is_sender(&self, _command: &ProtocolCommand) -> BusinessResult<bool> {
        Ok(true)
    }

    fn check_account_existence(&self, _command: &ProtocolCommand) -> BusinessResult<()> {
        Ok(())
    }

    fn validate_recipient_signature(&self, _command: &ProtocolCommand) -> BusinessResult<()> {
        Ok(())
    }

    fn next_kyc_to_provide(&self, _command: &ProtocolCommand) -> BusinessResult<Vec<KycLevel>> {
        Ok(vec![])
    }

    fn next_kyc_level_to_request(&self, _command: &ProtocolCommand) -> BusinessResult<KycLevel> {
        Ok(KycLevel::MaybeNeedsKyc)
    }

    fn validate_kyc_signature(&self, _command: &ProtocolCommand) -> BusinessResult<()> {
        Ok(())
    }

    fn ready_for_settlement(&self, _command: &ProtocolCommand) -> BusinessResult<bool> {
        Ok(true)
    }

    fn has_settled(&self, _command: &ProtocolCommand) -> BusinessResult<bool> {
        Ok(true)
    }
}

/// The reference command processor: validates through the payload and
/// counts commit outcomes, so tests can assert exactly-once semantics.
pub struct SampleProcessor {
    context: Arc<SampleContext>,
    outcomes: std::sync::Mutex<Vec<(String, bool)>>,
}

impl SampleProcessor {
    pub fn new() -> Self {
        SampleProcessor { context: Arc::new(SampleContext), outcomes: std::sync::Mutex::new(vec![]) }
    }

    /// The (label, success) commit outcomes seen so far, in commit order.
    pub fn outcomes(&self) -> Vec<(String, bool)> {
        self.outcomes.lock().expect("outcome lock poisoned").clone()
    }
}

impl Default for SampleProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandProcessor for SampleProcessor {
    fn validate(
        &self,
        command: &ProtocolCommand,
        context: &dyn BusinessContext,
        own: bool,
    ) -> BusinessResult<()> {
        command
            .payload
            .validate(context, own)
            .map_err(|err| BusinessCheck::ValidationFailure(err.to_string()))
    }

    fn process_success(&self, command: &ProtocolCommand) {
        self.outcomes
            .lock()
            .expect("outcome lock poisoned")
            .push((command.payload.label(), true));
    }

    fn process_failure(&self, command: &ProtocolCommand, _reason: &str) {
        self.outcomes
            .lock()
            .expect("outcome lock poisoned")
            .push((command.payload.label(), false));
    }

    fn business_context(&self) -> Arc<dyn BusinessContext> {
        self.context.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_shapes_the_version_sets() {
        let cmd = SampleCommand::make("world", vec!["hello"]);
        assert_eq!(cmd.creates, vec![VersionId::from("world")]);
        assert_eq!(cmd.depend_on, vec![VersionId::from("hello")]);
    }

    #[test]
    fn object_only_for_own_version() {
        let cmd = SampleCommand::make("hello", vec![]);
        let obj = cmd.payload.object(&VersionId::from("hello"), &[]).unwrap();
        assert_eq!(obj.version, VersionId::from("hello"));
        assert!(!obj.potentially_live);
        assert!(!obj.actually_live);
        assert!(cmd.payload.object(&VersionId::from("other"), &[]).is_err());
    }

    #[test]
    fn unhappy_commands_fail_peer_validation() {
        let processor = SampleProcessor::new();
        let context = processor.business_context();
        let cmd = SampleCommand::make_with_mood("hello", vec![], false);
        assert!(processor.validate(&cmd, context.as_ref(), true).is_ok());
        assert!(processor.validate(&cmd, context.as_ref(), false).is_err());
    }
}
