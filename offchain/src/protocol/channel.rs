use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::address::Address;
use crate::business::CommandProcessor;
use crate::command::ProtocolCommand;
use crate::crypto::Signer;
use crate::error::{CResult, Error};
use crate::executor::ProtocolExecutor;
use crate::protocol::messages::{
    self, CommandRequestObject, CommandResponseObject, NetCommand, NetEnvelope, OffChainErrorCode,
};
use crate::protocol::{MessageKind, NetMessage};
use crate::storage::factory::{StorableFactory, StorableList, StorableValue};
use crate::types::UidGenerator;

/// How far ahead of the peer's expected seq an inbound request may be and
/// still get buffered instead of answered with `missing`. A DoS bound, not
/// a correctness bound: beyond it the peer just retransmits.
const REQUEST_WINDOW: u64 = 1000;

/// The same bound for inbound responses ahead of the commit cursor.
const RESPONSE_WINDOW: u64 = 1000;

type RequestSender = oneshot::Sender<CResult<NetMessage>>;
type ResponseSender = oneshot::Sender<CResult<bool>>;

struct PendingRequest {
    request: CommandRequestObject,
    tx: RequestSender,
}

struct PendingResponse {
    response: CommandResponseObject,
    tx: ResponseSender,
}

/// The state of the off-chain channel between this VASP and one peer.
///
/// The persistent pieces (request journals, retransmit cursor, executor
/// state) live in the storable factory under a namespace derived from the
/// two addresses, and every mutating handler wraps itself in one atomic
/// write session. The reorder buffers and the response cache are
/// ephemeral: a crash loses them, and retransmission rebuilds them.
pub struct VaspPairChannel {
    myself: Address,
    other: Address,

    factory: Arc<StorableFactory>,
    processor: Arc<dyn CommandProcessor>,
    signer: Arc<dyn Signer>,
    uid: Arc<UidGenerator>,

    /// Requests this VASP initiated, by local seq.
    my_requests: StorableList<CommandRequestObject>,

    /// Requests the peer initiated, by the peer's seq.
    other_requests: StorableList<CommandRequestObject>,

    /// The smallest local seq that may still need retransmission.
    next_retransmit: StorableValue<u64>,

    executor: ProtocolExecutor,

    /// Future-dated responses, keyed by command_seq.
    response_cache: HashMap<u64, CommandResponseObject>,

    /// Out-of-order inbound messages awaiting a gap fill, each tagged with
    /// its completion handle.
    waiting_requests: HashMap<u64, Vec<PendingRequest>>,
    waiting_responses: HashMap<u64, Vec<PendingResponse>>,
}

impl VaspPairChannel {
    pub fn new(
        myself: Address,
        other: Address,
        factory: Arc<StorableFactory>,
        processor: Arc<dyn CommandProcessor>,
        signer: Arc<dyn Signer>,
        uid: Arc<UidGenerator>,
    ) -> CResult<Self> {
        if myself == other {
            return Err(Error::Channel(format!(
                "must talk to another VASP: {}",
                myself.as_str()
            )));
        }

        let my_str = myself.as_str();
        let other_str = other.as_str();
        let root: Vec<&str> = vec!["", &my_str, &other_str];

        let mut path = root.clone();
        path.push("my_requests");
        let my_requests = factory.make_list(&path);
        path.pop();
        path.push("other_requests");
        let other_requests = factory.make_list(&path);
        path.pop();
        path.push("next_retransmit");
        let next_retransmit = factory.make_value(&path, Some(0));

        let executor = ProtocolExecutor::new(&factory, &root, processor.clone());

        debug!("creating VASP channel {} -> {}", my_str, other_str);

        Ok(VaspPairChannel {
            myself,
            other,
            factory,
            processor,
            signer,
            uid,
            my_requests,
            other_requests,
            next_retransmit,
            executor,
            response_cache: HashMap::new(),
            waiting_requests: HashMap::new(),
            waiting_responses: HashMap::new(),
        })
    }

    pub fn my_address(&self) -> &Address {
        &self.myself
    }

    pub fn other_address(&self) -> &Address {
        &self.other
    }

    /// Is the local VASP the client for this pair? Both sides derive the
    /// same answer from the two addresses alone.
    pub fn is_client(&self) -> bool {
        let bit = self.myself.last_bit() ^ self.other.last_bit();
        if bit == 0 {
            self.myself.greater_than_or_equal(&self.other)
        } else {
            !self.myself.greater_than_or_equal(&self.other)
        }
    }

    pub fn is_server(&self) -> bool {
        !self.is_client()
    }

    /// The role as a string, for debug output.
    pub fn role(&self) -> &'static str {
        if self.is_client() {
            "Client"
        } else {
            "Server"
        }
    }

    pub fn my_next_seq(&mut self) -> CResult<u64> {
        self.my_requests.len()
    }

    pub fn other_next_seq(&mut self) -> CResult<u64> {
        self.other_requests.len()
    }

    /// The next index in the common committed sequence.
    pub fn next_final_sequence(&mut self) -> CResult<u64> {
        self.executor.next_seq()
    }

    /// The commands in the common sequence so far.
    pub fn get_final_sequence(&mut self) -> CResult<Vec<ProtocolCommand>> {
        self.executor.commands()
    }

    pub fn executor(&mut self) -> &mut ProtocolExecutor {
        &mut self.executor
    }

    pub fn my_request(&mut self, seq: u64) -> CResult<CommandRequestObject> {
        self.my_requests.get(seq)
    }

    /// Number of own requests still waiting for a response.
    pub fn num_pending_responses(&mut self) -> CResult<u64> {
        let mut pending = 0;
        for seq in 0..self.my_requests.len()? {
            if !self.my_requests.get(seq)?.has_response() {
                pending += 1;
            }
        }
        Ok(pending)
    }

    /// Number of requests at or after the retransmit cursor still waiting
    /// for a response.
    pub fn pending_retransmit_number(&mut self) -> CResult<u64> {
        let mut pending = 0;
        for seq in self.next_retransmit.get_value()?..self.my_requests.len()? {
            if !self.my_requests.get(seq)?.has_response() {
                pending += 1;
            }
        }
        Ok(pending)
    }

    fn verify(&self, signed: &str) -> CResult<String> {
        self.signer.verify(signed)
    }

    fn package_request(&self, request: &CommandRequestObject) -> CResult<NetMessage> {
        let content = self.signer.sign(&messages::encode_request(request)?)?;
        debug!("request sent {} -> {}", self.myself.as_str(), self.other.as_str());
        Ok(NetMessage {
            src: self.myself.clone(),
            dst: self.other.clone(),
            kind: MessageKind::Request,
            content,
        })
    }

    fn package_response(&self, response: &CommandResponseObject) -> CResult<NetMessage> {
        let content = self.signer.sign(&messages::encode_response(response)?)?;
        debug!("response sent {} -> {}", self.myself.as_str(), self.other.as_str());
        Ok(NetMessage {
            src: self.myself.clone(),
            dst: self.other.clone(),
            kind: MessageKind::Response,
            content,
        })
    }

    /// The local VASP submits a new off-chain command. On success the
    /// request is persisted and the wire message to emit is returned;
    /// emission happens outside any lock. A server that cannot sequence
    /// the command speculatively persists and emits nothing.
    pub fn sequence_command_local(&mut self, mut command: ProtocolCommand) -> CResult<NetMessage> {
        command.set_origin(self.myself.clone());
        let mut request =
            CommandRequestObject::new(self.uid.unique_str(), self.my_next_seq()?, command);

        let session = self.factory.atomic_writes()?;
        if self.is_server() {
            request.command_seq = Some(self.executor.next_seq()?);
            // An error here exits without sequencing or persisting.
            self.executor.sequence_next_command(request.command.clone(), true, true)?;
        }
        self.my_requests.push(&request)?;
        session.commit()?;

        self.package_request(&request)
    }

    /// Handles a decoded request from the peer and returns the response to
    /// send back. All persistent effects commit atomically.
    pub fn handle_request(&mut self, request: CommandRequestObject) -> CResult<CommandResponseObject> {
        let session = self.factory.atomic_writes()?;
        let response = self.process_request(request)?;
        self.process_pending()?;
        session.commit()?;
        Ok(response)
    }

    fn process_request(&mut self, mut request: CommandRequestObject) -> CResult<CommandResponseObject> {
        request.command.set_origin(self.other.clone());
        let other_next = self.other_next_seq()?;

        // Old requests are always answered: with the stored response for a
        // retransmission, or with a conflict echoing the original command
        // if the peer reused the seq for something else.
        if request.seq < other_next {
            let previous = self.other_requests.get(request.seq)?;
            if previous.is_same_command(&request) {
                return previous
                    .response
                    .clone()
                    .ok_or_else(|| Error::Internal("stored request lacks a response".to_string()));
            }
            let mut response = messages::make_protocol_error(&request, OffChainErrorCode::Conflict);
            if let Some(error) = response.error.as_mut() {
                error.previous_command = Some(NetCommand::from_command(&previous.command));
            }
            return Ok(response);
        }

        // Clients are not to suggest command sequence numbers.
        if self.is_server() && request.command_seq.is_some() {
            return Ok(messages::make_protocol_error(&request, OffChainErrorCode::Malformed));
        }

        // A server first waits for the verdict on all of its own requests
        // before sequencing client requests. This is what makes
        // server-initiated commands sort before concurrent client ones.
        if self.is_server() && self.num_pending_responses()? > 0 {
            return Ok(messages::make_protocol_error(&request, OffChainErrorCode::Wait));
        }

        if request.seq > other_next {
            // A gap in the peer's sequence: an earlier request is missing.
            return Ok(messages::make_protocol_error(&request, OffChainErrorCode::Missing));
        }

        // request.seq == other_next from here on.
        let next_final = self.executor.next_seq()?;
        if self.is_client() {
            if let Some(command_seq) = request.command_seq {
                if command_seq > next_final {
                    // Cannot confirm before sequencing earlier commands.
                    return Ok(messages::make_protocol_error(&request, OffChainErrorCode::Wait));
                }
            }
        }

        let outcome = self.executor.sequence_next_command(request.command.clone(), false, false);
        let mut response = match outcome {
            Ok(_) => messages::make_success_response(&request),
            Err(Error::Deferred) => {
                // Nothing was sequenced; the peer retransmits once the
                // business layer can answer.
                return Ok(messages::make_protocol_error(&request, OffChainErrorCode::Wait));
            }
            Err(err @ (Error::MissingDependency(_) | Error::CommandValidation(_))) => {
                messages::make_command_error(&request, err.to_string())
            }
            Err(err) => return Err(err),
        };
        response.command_seq = Some(next_final);

        request.response = Some(response.clone());
        self.other_requests.push(&request)?;
        self.apply_response_to_executor(&request)?;
        Ok(response)
    }

    /// Handles a decoded response to one of this VASP's requests. Returns
    /// true when the response is (or already was) applied, false when a
    /// protocol error leaves the request subject to retransmission.
    pub fn handle_response(&mut self, response: CommandResponseObject) -> CResult<bool> {
        let session = self.factory.atomic_writes()?;
        let applied = self.process_response(response)?;
        self.process_pending()?;
        session.commit()?;
        Ok(applied)
    }

    fn process_response(&mut self, response: CommandResponseObject) -> CResult<bool> {
        let request_seq = match response.seq {
            Some(seq) => seq,
            None => {
                // Only a parsing error carries no seq: our request never
                // decoded on the other side. Retransmission redrives it.
                if response.is_success() {
                    return Err(Error::Channel("success response without a seq".to_string()));
                }
                warn!("peer could not parse request: {:?}", response.error);
                return Ok(false);
            }
        };

        if request_seq >= self.my_requests.len()? {
            // Caught a bug (or malice) on the other side.
            return Err(Error::Channel(format!(
                "response for unknown request seq {}",
                request_seq
            )));
        }

        if response.is_protocol_failure() {
            match response.error.as_ref().map(|error| error.code) {
                Some(OffChainErrorCode::Wait) | Some(OffChainErrorCode::Missing) => {}
                Some(code) => {
                    warn!("protocol error {:?} for request {}", code, request_seq)
                }
                None => warn!("failure without error code for request {}", request_seq),
            }
            // The request stays unanswered; the retransmit tick redrives.
            return Ok(false);
        }

        // Cursor optimization: an in-order final response moves the
        // retransmit cursor past this request.
        let next_expected = self.next_retransmit.get_value()?;
        if next_expected == request_seq {
            self.next_retransmit.set_value(&(next_expected + 1))?;
        }

        let mut request = self.my_requests.get(request_seq)?;
        if let Some(stored) = &request.response {
            // Idempotent: already processed. Only log drift.
            if stored != &response {
                warn!("divergent duplicate response for request {}", request_seq);
            }
            return Ok(true);
        }

        let command_seq = response.command_seq.ok_or_else(|| {
            Error::Channel(format!("final response without command_seq for request {}", request_seq))
        })?;
        let next_final = self.executor.next_seq()?;
        let cursor = self.executor.last_confirmed()?;

        if command_seq == next_final {
            // The next command to sequence and commit.
            request.response = Some(response);
            self.my_requests.set(request_seq, &request)?;

            match self.executor.sequence_next_command(request.command.clone(), true, false) {
                Ok(_) => {}
                // The response verdict is what matters; a local
                // speculation failure is sequenced and then committed
                // by the verdict below.
                Err(Error::MissingDependency(_))
                | Err(Error::CommandValidation(_))
                | Err(Error::Deferred) => {}
                Err(err) => return Err(err),
            }
            self.apply_response_to_executor(&request)?;
            Ok(true)
        } else if command_seq == cursor {
            // A server observing its own already-sequenced command, in
            // commit order.
            request.response = Some(response);
            self.my_requests.set(request_seq, &request)?;
            self.apply_response_to_executor(&request)?;
            Ok(true)
        } else if command_seq > cursor {
            // Ahead of the commit cursor; hold it until the gap fills.
            // Commits strictly follow command_seq order.
            self.response_cache.insert(command_seq, response);
            Ok(true)
        } else {
            // Behind the cursor yet the request had no stored response.
            Err(Error::Channel(format!(
                "response for already-committed command_seq {}",
                command_seq
            )))
        }
    }

    fn apply_response_to_executor(&mut self, request: &CommandRequestObject) -> CResult<()> {
        let response = request
            .response
            .as_ref()
            .ok_or_else(|| Error::Internal("applying a request without a response".to_string()))?;
        let command_seq = response
            .command_seq
            .ok_or_else(|| Error::Internal("applying a response without a command_seq".to_string()))?;

        if request.is_success() {
            self.executor.set_success(command_seq)
        } else {
            let reason = response
                .error
                .as_ref()
                .and_then(|error| error.message.clone())
                .unwrap_or_default();
            self.executor.set_fail(command_seq, &reason)
        }
    }

    /// Drains whatever the last mutation unblocked: cached and buffered
    /// responses for the current command_seq, then buffered requests for
    /// the current peer seq. Runs inside the caller's write session.
    fn process_pending(&mut self) -> CResult<()> {
        loop {
            // Responses drain at the commit cursor: commits strictly
            // follow command_seq order.
            let cursor = self.executor.last_confirmed()?;
            if let Some(entries) = self.waiting_responses.remove(&cursor) {
                for entry in entries {
                    let result = self.process_response(entry.response);
                    let failed = result.is_err();
                    let _ = entry.tx.send(result);
                    if failed {
                        return Err(Error::Channel("buffered response failed".to_string()));
                    }
                }
                continue;
            }
            if let Some(response) = self.response_cache.remove(&cursor) {
                self.process_response(response)?;
                continue;
            }
            break;
        }

        loop {
            if self.is_server() && self.num_pending_responses()? > 0 {
                break;
            }
            let next_seq = self.other_next_seq()?;
            let Some(entries) = self.waiting_requests.remove(&next_seq) else {
                break;
            };
            for entry in entries {
                let result = self
                    .process_request(entry.request)
                    .and_then(|response| self.package_response(&response));
                let failed = result.is_err();
                let _ = entry.tx.send(result);
                if failed {
                    return Err(Error::Channel("buffered request failed".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Re-sends the earliest request without a response, if any,
    /// advancing the persisted retransmit cursor past answered entries.
    pub fn retransmit(&mut self) -> CResult<Option<NetMessage>> {
        match self.scan_retransmit()? {
            Some(request) => Ok(Some(self.package_request(&request)?)),
            None => Ok(None),
        }
    }

    /// True if any own request still awaits a response.
    pub fn would_retransmit(&mut self) -> CResult<bool> {
        Ok(self.scan_retransmit()?.is_some())
    }

    fn scan_retransmit(&mut self) -> CResult<Option<CommandRequestObject>> {
        let session = self.factory.atomic_writes()?;
        let mut cursor = self.next_retransmit.get_value()?;
        let len = self.my_requests.len()?;
        let mut found = None;
        while cursor < len {
            let request = self.my_requests.get(cursor)?;
            if request.has_response() {
                cursor += 1;
            } else {
                found = Some(request);
                break;
            }
        }
        self.next_retransmit.set_value(&cursor)?;
        session.commit()?;
        Ok(found)
    }

    // ---- Buffered entry points (used by ChannelRef) ----

    fn accept_request(&mut self, request: CommandRequestObject, nowait: bool, tx: RequestSender) {
        let buffered = match self.should_buffer_request(&request, nowait) {
            Ok(buffered) => buffered,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        if buffered {
            self.waiting_requests.entry(request.seq).or_default().push(PendingRequest { request, tx });
            return;
        }
        let result = self
            .handle_request(request)
            .and_then(|response| self.package_response(&response));
        let _ = tx.send(result);
    }

    fn should_buffer_request(&mut self, request: &CommandRequestObject, nowait: bool) -> CResult<bool> {
        if nowait {
            return Ok(false);
        }
        let other_next = self.other_next_seq()?;
        if request.seq > other_next && request.seq < other_next + REQUEST_WINDOW {
            return Ok(true);
        }
        // A busy server holds the in-order client request until its own
        // requests are answered, rather than bouncing it with `wait`.
        if request.seq == other_next && self.is_server() && self.num_pending_responses()? > 0 {
            return Ok(true);
        }
        Ok(false)
    }

    fn accept_response(&mut self, response: CommandResponseObject, nowait: bool, tx: ResponseSender) {
        let ahead = match self.response_ahead(&response) {
            Ok(ahead) => ahead,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        if let Some(command_seq) = ahead {
            if nowait {
                // Keep the data for the eventual gap fill, but tell the
                // synchronous caller it cannot be applied yet.
                self.response_cache.insert(command_seq, response);
                let _ = tx.send(Err(Error::OutOfOrder(format!(
                    "response for future command_seq {}",
                    command_seq
                ))));
            } else {
                self.waiting_responses
                    .entry(command_seq)
                    .or_default()
                    .push(PendingResponse { response, tx });
            }
            return;
        }
        let result = self.handle_response(response);
        let _ = tx.send(result);
    }

    fn response_ahead(&mut self, response: &CommandResponseObject) -> CResult<Option<u64>> {
        if let Some(command_seq) = response.command_seq {
            let cursor = self.executor.last_confirmed()?;
            if command_seq > cursor && command_seq < cursor + RESPONSE_WINDOW {
                return Ok(Some(command_seq));
            }
        }
        Ok(None)
    }
}

/// Shared handle to a channel: the locking facade through which the VASP
/// registry and the network layer drive it. Entry points return oneshot
/// receivers that resolve when the message is finally handled, possibly
/// after an out-of-order gap fills. Dropping the receiver cancels the
/// delivery of the result, never the persisted effects.
#[derive(Clone)]
pub struct ChannelRef {
    inner: Arc<Mutex<VaspPairChannel>>,
}

impl ChannelRef {
    pub fn new(channel: VaspPairChannel) -> Self {
        ChannelRef { inner: Arc::new(Mutex::new(channel)) }
    }

    /// Runs a closure against the locked channel. Test and inspection
    /// hook.
    pub fn with<R>(&self, f: impl FnOnce(&mut VaspPairChannel) -> R) -> R {
        let mut guard = self.inner.lock().expect("channel lock poisoned");
        f(&mut guard)
    }

    /// Submits a local command; the returned wire message is emitted by
    /// the caller, outside the channel lock.
    pub fn submit_command(&self, command: ProtocolCommand) -> CResult<NetMessage> {
        self.inner.lock()?.sequence_command_local(command)
    }

    /// Feeds a signed inbound request. The receiver resolves with the
    /// response message to send back.
    pub fn handle_net_request(
        &self,
        signed: &str,
        nowait: bool,
    ) -> oneshot::Receiver<CResult<NetMessage>> {
        let (tx, rx) = oneshot::channel();
        let mut channel = match self.inner.lock() {
            Ok(guard) => guard,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return rx;
            }
        };
        debug!(
            "request received {} -> {}",
            channel.other.as_str(),
            channel.myself.as_str()
        );
        let payload = match channel.verify(signed) {
            Ok(payload) => payload,
            Err(err) => {
                // Signature failure is fatal: no reply at all.
                let _ = tx.send(Err(err));
                return rx;
            }
        };
        let request = match messages::decode_envelope(&payload) {
            Ok(NetEnvelope::CommandRequestObject(net)) => net.into_request(),
            Ok(_) | Err(_) => {
                let response = messages::make_parsing_error();
                let _ = tx.send(channel.package_response(&response));
                return rx;
            }
        };
        channel.accept_request(request, nowait, tx);
        rx
    }

    /// Feeds a signed inbound response. The receiver resolves with true
    /// once the response is applied.
    pub fn handle_net_response(
        &self,
        signed: &str,
        nowait: bool,
    ) -> oneshot::Receiver<CResult<bool>> {
        let (tx, rx) = oneshot::channel();
        let mut channel = match self.inner.lock() {
            Ok(guard) => guard,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return rx;
            }
        };
        debug!(
            "response received {} -> {}",
            channel.other.as_str(),
            channel.myself.as_str()
        );
        let payload = match channel.verify(signed) {
            Ok(payload) => payload,
            Err(err) => {
                let _ = tx.send(Err(err));
                return rx;
            }
        };
        let response = match messages::decode_envelope(&payload) {
            Ok(NetEnvelope::CommandResponseObject(response)) => response,
            Ok(_) => {
                let _ = tx.send(Err(Error::Parse("expected a response envelope".to_string())));
                return rx;
            }
            Err(err) => {
                // There is nothing to reply to a response we cannot parse.
                let _ = tx.send(Err(err));
                return rx;
            }
        };
        channel.accept_response(response, nowait, tx);
        rx
    }

    /// Re-sends the earliest unanswered request, if any.
    pub fn retransmit(&self) -> CResult<Option<NetMessage>> {
        self.inner.lock()?.retransmit()
    }

    pub fn would_retransmit(&self) -> CResult<bool> {
        self.inner.lock()?.would_retransmit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandStatus;
    use crate::crypto::{NullSigner, TagSigner};
    use crate::sample::{SampleCommand, SampleProcessor};
    use crate::storage::memory::MemoryStore;

    fn make_channel(
        me: &[u8],
        peer: &[u8],
        seed: u64,
    ) -> (VaspPairChannel, Arc<SampleProcessor>, Arc<StorableFactory>) {
        let factory = Arc::new(StorableFactory::new(Box::new(MemoryStore::new())));
        let processor = Arc::new(SampleProcessor::new());
        let channel = VaspPairChannel::new(
            Address::new(me.to_vec()).unwrap(),
            Address::new(peer.to_vec()).unwrap(),
            factory.clone(),
            processor.clone(),
            Arc::new(NullSigner),
            Arc::new(UidGenerator::seeded(seed)),
        )
        .unwrap();
        (channel, processor, factory)
    }

    /// A (server, client) pair over the addresses "BBBB"/"AAAA".
    fn pair() -> (VaspPairChannel, VaspPairChannel) {
        let (server, _, _) = make_channel(b"BBBB", b"AAAA", 1);
        let (client, _, _) = make_channel(b"AAAA", b"BBBB", 2);
        assert!(server.is_server());
        assert!(client.is_client());
        (server, client)
    }

    fn as_request(msg: &NetMessage) -> CommandRequestObject {
        match messages::decode_envelope(&msg.content).unwrap() {
            NetEnvelope::CommandRequestObject(net) => net.into_request(),
            other => panic!("expected a request envelope, got {:?}", other),
        }
    }

    fn items(channel: &mut VaspPairChannel) -> Vec<String> {
        channel
            .get_final_sequence()
            .unwrap()
            .iter()
            .map(|cmd| cmd.payload.label())
            .collect()
    }

    #[test]
    fn roles_are_deterministic() {
        // Last bits differ ("AAAA" odd, "BBBB" even): the smaller address
        // is the client.
        let (ab, _, _) = make_channel(b"AAAA", b"BBBB", 0);
        let (ba, _, _) = make_channel(b"BBBB", b"AAAA", 0);
        assert!(ab.is_client() && !ab.is_server());
        assert!(ba.is_server() && !ba.is_client());
        assert_eq!(ab.role(), "Client");

        // Last bits equal ("AAAA" and "CCCC" both odd): the greater
        // address is the client.
        let (ac, _, _) = make_channel(b"AAAA", b"CCCC", 0);
        let (ca, _, _) = make_channel(b"CCCC", b"AAAA", 0);
        assert!(ac.is_server());
        assert!(ca.is_client());
    }

    #[test]
    fn channel_to_myself_is_rejected() {
        let factory = Arc::new(StorableFactory::new(Box::new(MemoryStore::new())));
        let me = Address::new(b"AAAA".to_vec()).unwrap();
        let result = VaspPairChannel::new(
            me.clone(),
            me,
            factory,
            Arc::new(SampleProcessor::new()),
            Arc::new(NullSigner),
            Arc::new(UidGenerator::seeded(0)),
        );
        assert!(matches!(result, Err(Error::Channel(_))));
    }

    #[test]
    fn server_client_benign() -> CResult<()> {
        let (mut server, mut client) = pair();

        let msg = server.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        assert_eq!(server.my_next_seq()?, 1);
        assert_eq!(server.next_final_sequence()?, 1); // pre-sequenced
        assert_eq!(server.executor().last_confirmed()?, 0);

        let request = as_request(&msg);
        assert_eq!(request.command_seq, Some(0));

        assert_eq!(client.other_next_seq()?, 0);
        let reply = client.handle_request(request)?;
        assert_eq!(client.other_next_seq()?, 1);
        assert!(reply.is_success());
        assert_eq!(reply.command_seq, Some(0));
        assert_eq!(client.executor().last_confirmed()?, 1);

        assert!(server.handle_response(reply)?);
        assert_eq!(server.executor().last_confirmed()?, 1);
        assert_eq!(items(&mut server), vec!["CMD(hello)"]);
        assert_eq!(items(&mut client), vec!["CMD(hello)"]);
        Ok(())
    }

    #[test]
    fn client_server_benign() -> CResult<()> {
        let (mut server, mut client) = pair();

        let msg = client.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        assert_eq!(client.my_next_seq()?, 1);
        assert_eq!(client.next_final_sequence()?, 0); // clients never pre-sequence
        let request = as_request(&msg);
        assert_eq!(request.command_seq, None);

        let reply = server.handle_request(request)?;
        assert!(reply.is_success());
        assert_eq!(reply.command_seq, Some(0));
        assert_eq!(server.other_next_seq()?, 1);
        assert_eq!(server.next_final_sequence()?, 1);

        assert!(!client.my_request(0)?.has_response());
        assert!(client.handle_response(reply)?);
        assert!(client.my_request(0)?.has_response());
        assert_eq!(client.next_final_sequence()?, 1);
        assert_eq!(items(&mut client), vec!["CMD(hello)"]);
        Ok(())
    }

    #[test]
    fn conflicting_seq_reuse_is_answered_with_the_original() -> CResult<()> {
        let (mut server, mut client) = pair();

        let msg = server.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        let request = as_request(&msg);
        let mut conflicting = request.clone();
        conflicting.command = SampleCommand::make("conflict", vec![]);
        conflicting.command_seq = request.command_seq;

        let reply = client.handle_request(request)?;
        let reply_conflict = client.handle_request(conflicting)?;

        // Only one command got sequenced, and the conflict reply echoes
        // the command originally seen at that seq.
        assert_eq!(client.other_next_seq()?, 1);
        assert!(reply.is_success());
        assert!(!reply_conflict.is_success());
        let error = reply_conflict.error.unwrap();
        assert_eq!(error.code, OffChainErrorCode::Conflict);
        let echoed = error.previous_command.unwrap();
        assert_eq!(echoed.creates, vec!["hello".into()]);

        assert!(server.handle_response(reply)?);
        assert_eq!(items(&mut server), vec!["CMD(hello)"]);
        Ok(())
    }

    #[test]
    fn interleaved_submissions_order_server_first() -> CResult<()> {
        let (mut server, mut client) = pair();

        let client_msg = client.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        let server_msg = server.sequence_command_local(SampleCommand::make("world", vec![]))?;
        let client_request = as_request(&client_msg);
        let server_request = as_request(&server_msg);

        // The busy server bounces the client request until its own
        // request is answered.
        let reply = server.handle_request(client_request.clone())?;
        assert_eq!(reply.error.unwrap().code, OffChainErrorCode::Wait);

        let client_reply = client.handle_request(server_request)?;
        assert!(server.handle_response(client_reply)?);
        let reply = server.handle_request(client_request)?;
        assert!(reply.is_success());
        assert!(client.handle_response(reply)?);

        assert_eq!(items(&mut client), vec!["CMD(world)", "CMD(hello)"]);
        assert_eq!(items(&mut server), vec!["CMD(world)", "CMD(hello)"]);
        Ok(())
    }

    #[test]
    fn interleaved_submissions_swapped_delivery() -> CResult<()> {
        let (mut server, mut client) = pair();

        let client_msg = client.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        let server_msg = server.sequence_command_local(SampleCommand::make("world", vec![]))?;
        let client_request = as_request(&client_msg);
        let server_request = as_request(&server_msg);

        // This time the client answers the server request first; the
        // outcome is the same.
        let client_reply = client.handle_request(server_request)?;
        let reply = server.handle_request(client_request.clone())?;
        assert_eq!(reply.error.unwrap().code, OffChainErrorCode::Wait);

        assert!(server.handle_response(client_reply)?);
        let reply = server.handle_request(client_request)?;
        assert!(client.handle_response(reply)?);

        assert_eq!(items(&mut client), vec!["CMD(world)", "CMD(hello)"]);
        assert_eq!(items(&mut server), vec!["CMD(world)", "CMD(hello)"]);
        Ok(())
    }

    #[test]
    fn request_gap_draws_missing() -> CResult<()> {
        let (mut server, mut client) = pair();

        let msg0 = client.sequence_command_local(SampleCommand::make("zero", vec![]))?;
        let msg1 = client.sequence_command_local(SampleCommand::make("one", vec![]))?;

        // seq 1 arrives before seq 0.
        let reply = server.handle_request(as_request(&msg1))?;
        assert_eq!(reply.error.unwrap().code, OffChainErrorCode::Missing);
        assert_eq!(server.other_next_seq()?, 0);

        assert!(server.handle_request(as_request(&msg0))?.is_success());
        assert!(server.handle_request(as_request(&msg1))?.is_success());
        assert_eq!(items(&mut server), vec!["CMD(zero)", "CMD(one)"]);
        Ok(())
    }

    #[test]
    fn future_responses_wait_in_the_cache() -> CResult<()> {
        let (mut server, mut client) = pair();

        let msg0 = client.sequence_command_local(SampleCommand::make("zero", vec![]))?;
        let msg1 = client.sequence_command_local(SampleCommand::make("one", vec![]))?;
        let reply0 = server.handle_request(as_request(&msg0))?;
        let reply1 = server.handle_request(as_request(&msg1))?;

        // The response for command_seq 1 arrives first: it is held, not
        // applied, and the request stays unanswered.
        assert!(client.handle_response(reply1)?);
        assert_eq!(client.executor().last_confirmed()?, 0);
        assert!(!client.my_request(1)?.has_response());

        // Applying command_seq 0 drains the cache in order.
        assert!(client.handle_response(reply0)?);
        assert_eq!(client.executor().last_confirmed()?, 2);
        assert!(client.my_request(1)?.has_response());
        assert!(!client.would_retransmit()?);
        Ok(())
    }

    #[test]
    fn client_supplied_command_seq_is_malformed() -> CResult<()> {
        let (mut server, mut client) = pair();

        let msg = client.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        let mut request = as_request(&msg);
        request.command_seq = Some(1);

        let reply = server.handle_request(request)?;
        assert_eq!(reply.error.unwrap().code, OffChainErrorCode::Malformed);
        assert_eq!(server.other_next_seq()?, 0);
        Ok(())
    }

    #[test]
    fn client_waits_for_unconfirmable_command_seq() -> CResult<()> {
        let (_, mut client) = pair();

        // A server request claiming a far-future slot in the common
        // sequence cannot be confirmed yet.
        let mut request = CommandRequestObject::new(
            "cid-x".to_string(),
            0,
            SampleCommand::make("hello", vec![]),
        );
        request.command_seq = Some(5);
        let reply = client.handle_request(request)?;
        assert_eq!(reply.error.unwrap().code, OffChainErrorCode::Wait);
        assert_eq!(client.other_next_seq()?, 0);
        Ok(())
    }

    #[test]
    fn request_redelivery_is_idempotent() -> CResult<()> {
        let (mut server, mut client) = pair();

        let msg = server.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        let reply = client.handle_request(as_request(&msg))?;
        let replay = client.handle_request(as_request(&msg))?;
        assert_eq!(reply, replay);
        assert_eq!(client.other_next_seq()?, 1);
        Ok(())
    }

    #[test]
    fn response_redelivery_is_idempotent() -> CResult<()> {
        let (mut server, mut client) = pair();

        let msg = server.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        let reply = client.handle_request(as_request(&msg))?;

        assert!(server.handle_response(reply.clone())?);
        // Exact duplicate: no-op. Divergent duplicate: no-op, logged.
        assert!(server.handle_response(reply.clone())?);
        let mut divergent = reply;
        divergent.command_seq = Some(9);
        assert!(server.handle_response(divergent)?);

        assert_eq!(server.executor().last_confirmed()?, 1);
        Ok(())
    }

    #[test]
    fn responses_for_unknown_requests_are_a_peer_bug() -> CResult<()> {
        let (mut server, mut client) = pair();

        let msg = server.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        let mut reply = client.handle_request(as_request(&msg))?;
        reply.seq = Some(7);
        assert!(matches!(server.handle_response(reply), Err(Error::Channel(_))));

        // A success response without a seq is equally buggy; a parsing
        // failure without one is expected and only redrives.
        let mut anon = messages::make_parsing_error();
        assert!(!server.handle_response(anon.clone())?);
        anon.status = messages::ResponseStatus::Success;
        assert!(matches!(server.handle_response(anon), Err(Error::Channel(_))));
        Ok(())
    }

    #[test]
    fn protocol_error_responses_leave_the_request_pending() -> CResult<()> {
        let (mut server, mut client) = pair();

        let client_msg = client.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        let _server_msg = server.sequence_command_local(SampleCommand::make("world", vec![]))?;

        let reply = server.handle_request(as_request(&client_msg))?;
        assert_eq!(reply.error.as_ref().unwrap().code, OffChainErrorCode::Wait);

        // The wait reply does not settle the request: the client will
        // retransmit it later.
        assert!(!client.handle_response(reply)?);
        assert!(!client.my_request(0)?.has_response());
        assert!(client.would_retransmit()?);
        Ok(())
    }

    #[test]
    fn failed_commands_commit_as_failed_on_both_sides() -> CResult<()> {
        let (server_parts, client_parts) = (
            make_channel(b"BBBB", b"AAAA", 1),
            make_channel(b"AAAA", b"BBBB", 2),
        );
        let (mut server, server_proc, _) = server_parts;
        let (mut client, client_proc, _) = client_parts;

        let msg =
            server.sequence_command_local(SampleCommand::make_with_mood("bad", vec![], false))?;
        let reply = client.handle_request(as_request(&msg))?;
        assert!(!reply.is_success());
        assert!(!reply.is_protocol_failure()); // terminal command failure
        assert_eq!(reply.command_seq, Some(0));

        assert!(server.handle_response(reply)?);

        assert_eq!(server.executor().command(0)?.commit_status, CommandStatus::Failed);
        assert_eq!(client.executor().command(0)?.commit_status, CommandStatus::Failed);
        assert_eq!(server.executor().count_potentially_live()?, 0);
        assert_eq!(client.executor().count_potentially_live()?, 0);

        // Exactly one failure hook ran on each side.
        assert_eq!(server_proc.outcomes(), vec![("CMD(bad)".to_string(), false)]);
        assert_eq!(client_proc.outcomes(), vec![("CMD(bad)".to_string(), false)]);
        Ok(())
    }

    #[test]
    fn crash_before_emission_is_recovered_by_retransmission() -> CResult<()> {
        let (client, _, client_factory) = make_channel(b"AAAA", b"BBBB", 2);
        let client_processor = Arc::new(SampleProcessor::new());
        let (mut server, _, _) = make_channel(b"BBBB", b"AAAA", 1);

        // The request is persisted, then the emitted message is lost.
        let mut client = client;
        let _lost = client.sequence_command_local(SampleCommand::make("hello", vec![]))?;
        drop(client);

        // Reopen over the same store: the retransmit tick re-emits.
        let mut client = VaspPairChannel::new(
            Address::new(b"AAAA".to_vec()).unwrap(),
            Address::new(b"BBBB".to_vec()).unwrap(),
            client_factory,
            client_processor,
            Arc::new(NullSigner),
            Arc::new(UidGenerator::seeded(9)),
        )?;
        assert!(client.would_retransmit()?);
        let msg = client.retransmit()?.expect("a pending request to re-send");

        // Double delivery collapses to one sequenced command.
        let reply = server.handle_request(as_request(&msg))?;
        let replay = server.handle_request(as_request(&msg))?;
        assert_eq!(reply, replay);
        assert!(client.handle_response(reply)?);
        assert!(!client.would_retransmit()?);
        assert_eq!(items(&mut client), vec!["CMD(hello)"]);
        assert_eq!(items(&mut server), vec!["CMD(hello)"]);
        Ok(())
    }

    // ---- ChannelRef facade ----

    fn facade_pair() -> (ChannelRef, ChannelRef) {
        let (server, _, _) = make_channel(b"BBBB", b"AAAA", 1);
        let (client, _, _) = make_channel(b"AAAA", b"BBBB", 2);
        (ChannelRef::new(server), ChannelRef::new(client))
    }

    #[tokio::test]
    async fn facade_round_trip() -> CResult<()> {
        let (server, client) = facade_pair();

        let msg = server.submit_command(SampleCommand::make("hello", vec![]))?;
        let reply = client
            .handle_net_request(&msg.content, false)
            .await
            .expect("handler dropped")?;
        assert_eq!(reply.kind, MessageKind::Response);

        let applied = server
            .handle_net_response(&reply.content, false)
            .await
            .expect("handler dropped")?;
        assert!(applied);
        assert_eq!(server.with(|ch| ch.next_final_sequence()).unwrap(), 1);
        assert_eq!(client.with(|ch| ch.next_final_sequence()).unwrap(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn facade_buffers_out_of_order_requests() -> CResult<()> {
        let (server, client) = facade_pair();

        let msg0 = server.submit_command(SampleCommand::make("zero", vec![]))?;
        let msg1 = server.submit_command(SampleCommand::make("one", vec![]))?;

        // seq 1 first: buffered, not answered.
        let mut rx1 = client.handle_net_request(&msg1.content, false);
        assert!(rx1.try_recv().is_err());

        // seq 0 fills the gap; both resolve.
        let reply0 = client
            .handle_net_request(&msg0.content, false)
            .await
            .expect("handler dropped")?;
        let reply1 = rx1.await.expect("handler dropped")?;

        assert!(server.handle_net_response(&reply0.content, false).await.expect("dropped")?);
        assert!(server.handle_net_response(&reply1.content, false).await.expect("dropped")?);
        assert_eq!(client.with(|ch| ch.next_final_sequence()).unwrap(), 2);
        assert_eq!(server.with(|ch| ch.executor().last_confirmed()).unwrap(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn facade_nowait_answers_immediately() -> CResult<()> {
        let (server, client) = facade_pair();

        let _msg0 = server.submit_command(SampleCommand::make("zero", vec![]))?;
        let msg1 = server.submit_command(SampleCommand::make("one", vec![]))?;

        let reply = client
            .handle_net_request(&msg1.content, true)
            .await
            .expect("handler dropped")?;
        match messages::decode_envelope(&reply.content)? {
            NetEnvelope::CommandResponseObject(response) => {
                assert_eq!(response.error.unwrap().code, OffChainErrorCode::Missing);
            }
            other => panic!("expected a response, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn facade_cancellation_does_not_stall_the_channel() -> CResult<()> {
        let (server, client) = facade_pair();

        let msg0 = server.submit_command(SampleCommand::make("zero", vec![]))?;
        let msg1 = server.submit_command(SampleCommand::make("one", vec![]))?;

        // The caller gives up on the buffered request; its effects still
        // apply once the gap fills.
        let rx1 = client.handle_net_request(&msg1.content, false);
        drop(rx1);

        client.handle_net_request(&msg0.content, false).await.expect("handler dropped")?;
        assert_eq!(client.with(|ch| ch.other_next_seq()).unwrap(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn facade_replies_parsing_error_to_garbage() -> CResult<()> {
        let (_, client) = facade_pair();

        let reply = client
            .handle_net_request("this is not json", false)
            .await
            .expect("handler dropped")?;
        match messages::decode_envelope(&reply.content)? {
            NetEnvelope::CommandResponseObject(response) => {
                let error = response.error.unwrap();
                assert_eq!(error.code, OffChainErrorCode::Parsing);
                assert_eq!(response.cid, None);
            }
            other => panic!("expected a response, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn facade_signature_failure_is_fatal() {
        let factory = Arc::new(StorableFactory::new(Box::new(MemoryStore::new())));
        let channel = VaspPairChannel::new(
            Address::new(b"AAAA".to_vec()).unwrap(),
            Address::new(b"BBBB".to_vec()).unwrap(),
            factory,
            Arc::new(SampleProcessor::new()),
            Arc::new(TagSigner::new("alice")),
            Arc::new(UidGenerator::seeded(0)),
        )
        .unwrap();
        let client = ChannelRef::new(channel);

        let result = client
            .handle_net_request("bob.{\"anything\": 1}", false)
            .await
            .expect("handler dropped");
        assert!(matches!(result, Err(Error::Signature(_))));
    }

    #[tokio::test]
    async fn facade_nowait_future_response_is_out_of_order() -> CResult<()> {
        let (server, client) = facade_pair();

        let msg0 = client.submit_command(SampleCommand::make("zero", vec![]))?;
        let msg1 = client.submit_command(SampleCommand::make("one", vec![]))?;
        let reply0 = server.handle_net_request(&msg0.content, false).await.expect("dropped")?;
        let reply1 = server.handle_net_request(&msg1.content, false).await.expect("dropped")?;

        // The future response cannot be applied synchronously.
        let result = client.handle_net_response(&reply1.content, true).await.expect("dropped");
        assert!(matches!(result, Err(Error::OutOfOrder(_))));

        // But it was cached: applying the current one drains it.
        assert!(client.handle_net_response(&reply0.content, false).await.expect("dropped")?);
        assert_eq!(client.with(|ch| ch.executor().last_confirmed()).unwrap(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn facade_buffered_responses_resolve_on_gap_fill() -> CResult<()> {
        let (server, client) = facade_pair();

        let msg0 = client.submit_command(SampleCommand::make("zero", vec![]))?;
        let msg1 = client.submit_command(SampleCommand::make("one", vec![]))?;
        let reply0 = server.handle_net_request(&msg0.content, false).await.expect("dropped")?;
        let reply1 = server.handle_net_request(&msg1.content, false).await.expect("dropped")?;

        let mut rx1 = client.handle_net_response(&reply1.content, false);
        assert!(rx1.try_recv().is_err());

        assert!(client.handle_net_response(&reply0.content, false).await.expect("dropped")?);
        assert!(rx1.await.expect("handler dropped")?);
        assert_eq!(client.with(|ch| ch.executor().last_confirmed()).unwrap(), 2);
        Ok(())
    }
}
