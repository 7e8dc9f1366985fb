//! `offchain` is the core of an off-chain payment coordination protocol
//! between pairs of VASPs. Each pair maintains a bidirectional channel over
//! which both sides exchange commands that mutate a shared, versioned
//! object store, and converge on an identical totally-ordered sequence of
//! committed commands -- under message reordering, drops, retransmissions
//! and concurrent submissions, without any third-party coordinator.
//!
//! The pieces, bottom up: a transactional namespaced key/value store
//! ([`storage::store::KvStore`], with the in-memory reference engine
//! [`storage::memory::MemoryStore`]); typed storables and scoped atomic
//! write sessions ([`storage::factory::StorableFactory`]); the shared
//! object executor that sequences commands under speculative or committed
//! liveness ([`executor::ProtocolExecutor`]); the wire envelopes
//! ([`protocol::messages`]); the per-pair channel state machine
//! ([`protocol::channel::VaspPairChannel`]); and the per-VASP registry
//! ([`protocol::OffChainVasp`]).
//!
//! ## Getting started
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use offchain::address::Address;
//! use offchain::crypto::NullSigner;
//! use offchain::error::CResult;
//! use offchain::protocol::channel::VaspPairChannel;
//! use offchain::protocol::messages::{self, NetEnvelope};
//! use offchain::sample::{SampleCommand, SampleProcessor};
//! use offchain::storage::factory::StorableFactory;
//! use offchain::storage::memory::MemoryStore;
//! use offchain::types::UidGenerator;
//!
//! fn channel(me: &[u8], peer: &[u8]) -> CResult<VaspPairChannel> {
//!     VaspPairChannel::new(
//!         Address::new(me.to_vec())?,
//!         Address::new(peer.to_vec())?,
//!         Arc::new(StorableFactory::new(Box::new(MemoryStore::new()))),
//!         Arc::new(SampleProcessor::new()),
//!         Arc::new(NullSigner),
//!         Arc::new(UidGenerator::seeded(1)),
//!     )
//! }
//!
//! fn main() -> CResult<()> {
//!     // Both sides derive their role from the two addresses alone:
//!     // "BBBB" serves this pair, "AAAA" is the client.
//!     let mut server = channel(b"BBBB", b"AAAA")?;
//!     let mut client = channel(b"AAAA", b"BBBB")?;
//!     assert!(server.is_server() && client.is_client());
//!
//!     // The server submits a command; the wire request reaches the
//!     // client, which sequences it and answers with success.
//!     let request = server.sequence_command_local(SampleCommand::make("hello", vec![]))?;
//!     let reply = match messages::decode_envelope(&request.content)? {
//!         NetEnvelope::CommandRequestObject(net) => client.handle_request(net.into_request())?,
//!         _ => unreachable!(),
//!     };
//!
//!     // Applying the response commits the command on the server too.
//!     server.handle_response(reply)?;
//!     assert_eq!(server.next_final_sequence()?, 1);
//!     assert_eq!(client.next_final_sequence()?, 1);
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod business;
pub mod command;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod sample;
pub mod storage;
pub mod types;
