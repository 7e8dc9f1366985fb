use serde_derive::{Deserialize, Serialize};

use crate::command::{CommandPayload, ProtocolCommand};
use crate::error::CResult;
use crate::types::VersionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Failure,
}

/// Error codes a failure response can carry. All but `command_failure`
/// are protocol errors: non-terminal replies instructing the sender to
/// retry or repair rather than treat the command as committed or failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffChainErrorCode {
    /// The payload could not be decoded; the response echoes no cid.
    Parsing,
    /// Well-formed but violating a role rule.
    Malformed,
    /// The receiver cannot answer yet; retransmit later.
    Wait,
    /// An earlier request in the sender's sequence has not been seen yet.
    Missing,
    /// The seq was previously used for a different command.
    Conflict,
    /// The command itself was sequenced but failed validation; terminal.
    CommandFailure,
}

impl OffChainErrorCode {
    pub fn is_protocol(&self) -> bool {
        !matches!(self, OffChainErrorCode::CommandFailure)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OffChainError {
    pub code: OffChainErrorCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// On conflict, the command previously seen at the disputed seq, so
    /// the peer can diagnose what it is conflicting with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_command: Option<NetCommand>,
}

/// A request as this VASP records it: the immutable envelope plus, once
/// known, the response it drew. Only the channel attaches the response;
/// the wire form (NetRequest) never carries one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRequestObject {
    pub cid: String,
    pub seq: u64,
    pub command_seq: Option<u64>,
    pub command: ProtocolCommand,
    pub response: Option<CommandResponseObject>,
}

impl CommandRequestObject {
    pub fn new(cid: String, seq: u64, command: ProtocolCommand) -> Self {
        CommandRequestObject { cid, seq, command_seq: None, command, response: None }
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(&self.response, Some(response) if response.status == ResponseStatus::Success)
    }

    pub fn is_same_command(&self, other: &CommandRequestObject) -> bool {
        self.command.is_same_command(&other.command)
    }
}

/// A response. The same shape serves the wire and the stored record: a
/// response has no private audit fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResponseObject {
    #[serde(default)]
    pub cid: Option<String>,

    #[serde(default)]
    pub seq: Option<u64>,

    #[serde(default)]
    pub command_seq: Option<u64>,

    pub status: ResponseStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OffChainError>,
}

impl CommandResponseObject {
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// True for wait/missing/conflict/malformed/parsing failures; false
    /// for successes and terminal command failures.
    pub fn is_protocol_failure(&self) -> bool {
        self.status == ResponseStatus::Failure
            && matches!(&self.error, Some(error) if error.code.is_protocol())
    }
}

/// A success response echoing the request's correlator and seq. The
/// command_seq is stamped by the channel once the command is sequenced.
pub fn make_success_response(request: &CommandRequestObject) -> CommandResponseObject {
    CommandResponseObject {
        cid: Some(request.cid.clone()),
        seq: Some(request.seq),
        command_seq: None,
        status: ResponseStatus::Success,
        error: None,
    }
}

/// A protocol-error failure response (wait, missing, conflict, malformed).
pub fn make_protocol_error(
    request: &CommandRequestObject,
    code: OffChainErrorCode,
) -> CommandResponseObject {
    CommandResponseObject {
        cid: Some(request.cid.clone()),
        seq: Some(request.seq),
        command_seq: None,
        status: ResponseStatus::Failure,
        error: Some(OffChainError { code, message: None, previous_command: None }),
    }
}

/// The reply to an undecodable payload. No cid or seq can be echoed.
pub fn make_parsing_error() -> CommandResponseObject {
    CommandResponseObject {
        cid: None,
        seq: None,
        command_seq: None,
        status: ResponseStatus::Failure,
        error: Some(OffChainError {
            code: OffChainErrorCode::Parsing,
            message: None,
            previous_command: None,
        }),
    }
}

/// A terminal failure response carrying the executor's error text.
pub fn make_command_error(
    request: &CommandRequestObject,
    message: String,
) -> CommandResponseObject {
    CommandResponseObject {
        cid: Some(request.cid.clone()),
        seq: Some(request.seq),
        command_seq: None,
        status: ResponseStatus::Failure,
        error: Some(OffChainError {
            code: OffChainErrorCode::CommandFailure,
            message: Some(message),
            previous_command: None,
        }),
    }
}

// ---- Wire forms ----
//
// Net serialization omits the private audit fields (commit status, stored
// responses); Store serialization above is full fidelity.

/// The wire form of a command: payload plus version sets, no commit
/// status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetCommand {
    #[serde(flatten)]
    pub payload: CommandPayload,

    pub depend_on: Vec<VersionId>,

    pub creates: Vec<VersionId>,
}

impl NetCommand {
    pub fn from_command(command: &ProtocolCommand) -> Self {
        NetCommand {
            payload: command.payload.clone(),
            depend_on: command.depend_on.clone(),
            creates: command.creates.clone(),
        }
    }

    pub fn into_command(self) -> ProtocolCommand {
        ProtocolCommand::new(self.payload, self.depend_on, self.creates)
    }
}

/// The wire form of a request: no stored response, command in net form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetRequest {
    pub cid: String,
    pub seq: u64,
    #[serde(default)]
    pub command_seq: Option<u64>,
    pub command: NetCommand,
}

impl NetRequest {
    pub fn from_request(request: &CommandRequestObject) -> Self {
        NetRequest {
            cid: request.cid.clone(),
            seq: request.seq,
            command_seq: request.command_seq,
            command: NetCommand::from_command(&request.command),
        }
    }

    pub fn into_request(self) -> CommandRequestObject {
        let mut request = CommandRequestObject::new(self.cid, self.seq, self.command.into_command());
        request.command_seq = self.command_seq;
        request
    }
}

/// Everything that can arrive on the wire, selected by `_ObjectType`.
/// Unknown object types fail to parse; unknown extra fields are ignored.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "_ObjectType")]
pub enum NetEnvelope {
    CommandRequestObject(NetRequest),
    CommandResponseObject(CommandResponseObject),
}

pub fn encode_request(request: &CommandRequestObject) -> CResult<String> {
    Ok(serde_json::to_string(&NetEnvelope::CommandRequestObject(NetRequest::from_request(
        request,
    )))?)
}

pub fn encode_response(response: &CommandResponseObject) -> CResult<String> {
    Ok(serde_json::to_string(&NetEnvelope::CommandResponseObject(response.clone()))?)
}

pub fn decode_envelope(json: &str) -> CResult<NetEnvelope> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandStatus;
    use crate::sample::SampleCommand;

    fn request(item: &str, seq: u64) -> CommandRequestObject {
        CommandRequestObject::new(format!("cid-{}", seq), seq, SampleCommand::make(item, vec![]))
    }

    #[test]
    fn request_net_round_trip() -> CResult<()> {
        let mut req = request("hello", 3);
        req.command_seq = Some(7);

        let json = encode_request(&req)?;
        let value: serde_json::Value = serde_json::from_str(&json)?;
        assert_eq!(value["_ObjectType"], "CommandRequestObject");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["command_seq"], 7);
        assert_eq!(value["command"]["_ObjectType"], "SampleCommand");
        // Private audit fields stay off the wire.
        assert!(value["command"].get("commit_status").is_none());
        assert!(value.get("response").is_none());

        match decode_envelope(&json)? {
            NetEnvelope::CommandRequestObject(net) => {
                let back = net.into_request();
                assert!(back.is_same_command(&req));
                assert_eq!(back.seq, 3);
                assert_eq!(back.command_seq, Some(7));
                assert_eq!(back.command.commit_status, CommandStatus::Pending);
                assert!(back.response.is_none());
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn store_round_trip_keeps_full_fidelity() -> CResult<()> {
        let mut req = request("hello", 0);
        req.command.commit_status = CommandStatus::Success;
        let mut resp = make_success_response(&req);
        resp.command_seq = Some(0);
        req.response = Some(resp.clone());

        let stored = serde_json::to_string(&req)?;
        let back: CommandRequestObject = serde_json::from_str(&stored)?;
        assert!(back.is_same_command(&req));
        assert_eq!(back.command.commit_status, CommandStatus::Success);
        assert_eq!(back.response, Some(resp));
        Ok(())
    }

    #[test]
    fn unknown_object_type_is_a_parse_error() {
        let json = r#"{"_ObjectType": "MysteryObject", "seq": 0}"#;
        assert!(decode_envelope(json).is_err());
        let json = r#"{"seq": 0}"#;
        assert!(decode_envelope(json).is_err());
    }

    #[test]
    fn unknown_extra_fields_are_ignored() -> CResult<()> {
        let json = encode_request(&request("hello", 0))?;
        let mut value: serde_json::Value = serde_json::from_str(&json)?;
        value["future_field"] = serde_json::json!("ignored");
        value["command"]["another"] = serde_json::json!(42);
        assert!(decode_envelope(&value.to_string()).is_ok());
        Ok(())
    }

    #[test]
    fn response_constructors() {
        let req = request("hello", 5);

        let ok = make_success_response(&req);
        assert_eq!(ok.cid.as_deref(), Some("cid-5"));
        assert_eq!(ok.seq, Some(5));
        assert!(ok.is_success());
        assert!(!ok.is_protocol_failure());

        let wait = make_protocol_error(&req, OffChainErrorCode::Wait);
        assert!(wait.is_protocol_failure());

        let parsing = make_parsing_error();
        assert_eq!(parsing.cid, None);
        assert!(parsing.is_protocol_failure());

        let failed = make_command_error(&req, "missing dependency: x".to_string());
        assert!(!failed.is_success());
        assert!(!failed.is_protocol_failure());
        assert_eq!(failed.error.unwrap().code, OffChainErrorCode::CommandFailure);
    }

    #[test]
    fn conflict_echoes_the_previous_command() -> CResult<()> {
        let req = request("hello", 0);
        let mut conflict = make_protocol_error(&req, OffChainErrorCode::Conflict);
        if let Some(error) = conflict.error.as_mut() {
            error.previous_command = Some(NetCommand::from_command(&req.command));
        }

        let json = encode_response(&conflict)?;
        match decode_envelope(&json)? {
            NetEnvelope::CommandResponseObject(back) => {
                let echoed = back.error.unwrap().previous_command.unwrap();
                assert_eq!(echoed, NetCommand::from_command(&req.command));
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
        Ok(())
    }
}
