// zg-test-utils: Shared test utilities for the gateway suite.
//
// Provides a mock relay WebSocket server, a deterministic fake signer, and
// event fixtures so integration tests can drive the full pipeline without
// real keys, relays, or an AI backend.

pub mod fake_signer;
pub mod fixtures;
pub mod mock_relay;

pub use fake_signer::FakeSigner;
pub use mock_relay::MockRelay;
