//  Copyright 2024, The Warthog Project
//
//  Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
//  following conditions are met:
//
//  1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
//  disclaimer.
//
//  2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
//  following disclaimer in the documentation and/or other materials provided with the distribution.
//
//  3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
//  products derived from this software without specific prior written permission.
//
//  THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
//  INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
//  DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
//  SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
//  SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
//  WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
//  USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

pub mod batch;
pub mod batch_registry;
pub mod chain_cache;
pub mod descripted;
pub mod error;
pub mod extendable;
pub mod fork_range;
pub mod header_chain;
pub mod signed_snapshot;
pub mod verifier;

pub use batch::{Batch, ChainPin, Grid};
pub use batch_registry::{BatchRegistry, SharedBatch, SnapshotMismatch};
pub use chain_cache::{
    CacheChain,
    ChainCacheMatch,
    ConsensusAppend,
    ConsensusFork,
    ConsensusState,
    ConsensusUpdate,
    RollbackData,
    RollbackDelta,
    StageAndConsensus,
};
pub use descripted::Descripted;
pub use error::{ChainError, ChainErrorKind};
pub use extendable::{ExtendableHeaderChain, MiningData};
pub use fork_range::{binary_forksearch, Change, ForkRange};
pub use header_chain::{
    fork_height,
    ChainSkeleton,
    ForkHeight,
    HeaderChain,
    HeaderChainAppend,
    HeaderChainFork,
    HeaderSpan,
};
pub use signed_snapshot::{
    FirstByteAuthority,
    NonzeroSnapshotPriority,
    RecoverableSignature,
    SignedSnapshot,
    SnapshotAuthority,
    SnapshotPriority,
};
pub use verifier::{HeaderVerifier, PreparedAppend};
