use std::sync::Arc;

use crate::address::Address;
use crate::command::ProtocolCommand;
use crate::error::CResult;

/// Outcome of a business predicate that did not simply succeed. These are
/// values, not panics: the channel inspects the outcome and reacts
/// (retry later, surface a permanent failure, or abort the command).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusinessCheck {
    /// The answer cannot be produced right now; ask again once nudged.
    Deferred,

    /// The requesting VASP is not authorized to receive the information.
    NotAuthorized,

    /// A business check failed; the command must not commit successfully.
    ValidationFailure(String),

    /// The business layer commands the payment be aborted.
    ForceAbort(String),
}

impl std::fmt::Display for BusinessCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusinessCheck::Deferred => write!(f, "deferred"),
            BusinessCheck::NotAuthorized => write!(f, "not authorized"),
            BusinessCheck::ValidationFailure(msg) => write!(f, "validation failure: {}", msg),
            BusinessCheck::ForceAbort(msg) => write!(f, "force abort: {}", msg),
        }
    }
}

pub type BusinessResult<T> = std::result::Result<T, BusinessCheck>;

/// The KYC levels one VASP can provide to or request from the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KycLevel {
    MaybeNeedsKyc,
    NeedsStableId,
    NeedsKycData,
}

/// The business environment of a VASP, as seen by the command validator.
/// One instance serves all channels of a VASP.
///
/// Each predicate may resolve normally or report a BusinessCheck outcome;
/// `Deferred` means the caller must re-drive the question later.
pub trait BusinessContext: Send + Sync {
    /// Called before a channel to the peer is opened.
    fn open_channel_to(&self, peer: &Address) -> BusinessResult<()>;

    // ----- Actors -----

    /// True if this VASP is the sender of the funds the command moves.
    fn is_sender(&self, command: &ProtocolCommand) -> BusinessResult<bool>;

    fn is_recipient(&self, command: &ProtocolCommand) -> BusinessResult<bool> {
        Ok(!self.is_sender(command)?)
    }

    /// Checks that the actor on this VASP exists.
    fn check_account_existence(&self, command: &ProtocolCommand) -> BusinessResult<()>;

    // ----- Signatures -----

    /// Validates the recipient signature, if present.
    fn validate_recipient_signature(&self, command: &ProtocolCommand) -> BusinessResult<()>;

    // ----- KYC -----

    /// The levels of KYC to provide to the other VASP right now. Empty
    /// means nothing should be provided at this moment.
    fn next_kyc_to_provide(&self, command: &ProtocolCommand) -> BusinessResult<Vec<KycLevel>>;

    /// The next level of KYC to request from the other VASP, or the
    /// current level if no new information is required.
    fn next_kyc_level_to_request(&self, command: &ProtocolCommand) -> BusinessResult<KycLevel>;

    /// Validates the KYC signature, if present.
    fn validate_kyc_signature(&self, command: &ProtocolCommand) -> BusinessResult<()>;

    // ----- Settlement -----

    /// Whether the payment is ready for settlement as far as this VASP is
    /// concerned. Once true it must never turn false again; this is the
    /// finality barrier for this VASP.
    fn ready_for_settlement(&self, command: &ProtocolCommand) -> BusinessResult<bool>;

    /// Whether the payment has settled on chain. Called past the finality
    /// barrier, so it must never force an abort.
    fn has_settled(&self, command: &ProtocolCommand) -> BusinessResult<bool>;
}

/// Checks and processes commands on behalf of the application. Consumed by
/// the executor for validity and by the channel for post-commit hooks.
pub trait CommandProcessor: Send + Sync {
    /// Application-level validity of a command. `own` is true when this
    /// VASP submitted the command and the check runs speculatively.
    fn validate(
        &self,
        command: &ProtocolCommand,
        context: &dyn BusinessContext,
        own: bool,
    ) -> BusinessResult<()>;

    /// Invoked exactly once when a command commits successfully.
    fn process_success(&self, command: &ProtocolCommand);

    /// Invoked exactly once when a command commits as failed.
    fn process_failure(&self, command: &ProtocolCommand, reason: &str);

    /// The business environment the validator consults.
    fn business_context(&self) -> Arc<dyn BusinessContext>;
}

/// Network information about peers: where to reach them and how to close
/// the transport when a channel is torn down. TLS and discovery live
/// behind this seam.
pub trait VaspInfo: Send + Sync {
    fn peer_base_url(&self, peer: &Address) -> CResult<String>;

    fn close_connection(&self, peer: &Address);
}
