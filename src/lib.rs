//! Rillflow is an in-process streaming engine: pipelines of composable
//! operators fed by sources (including change-data-capture sources), backed
//! by pluggable state stores.
//!
//! A pipeline is declared with the fluent [`StreamBuilder`] and driven by the
//! [`Stream`] runtime:
//!
//! ```
//! use rillflow::prelude::*;
//!
//! let (sink, collected) = CollectVecSink::new();
//! let mut stream = StreamBuilder::create("evens")
//!     .source(IteratorSource::new(1..=5))
//!     .filter(|x| x % 2 == 0)
//!     .map(|x| x * 10)
//!     .sink_op(sink)
//!     .build();
//! stream.start().unwrap();
//! # std::thread::sleep(std::time::Duration::from_millis(200));
//! stream.stop().unwrap();
//! assert_eq!(collected.snapshot(), vec![20, 40]);
//! ```
//!
//! Stateful operators (grouping, aggregation, windows, joins) read and write
//! through the [`StateStore`](store::StateStore) abstraction; the in-memory
//! store works out of the box and the SQL-backed stores persist through the
//! abstract [`SqlClient`](store::sql::SqlClient) executor. CDC sources
//! ([`cdc`]) harvest row-level changes from relational logs, logical
//! replication slots and document change streams, checkpoint their progress
//! and suppress adjacent duplicates before emitting into the pipeline.

pub mod cdc;
pub mod clock;
pub mod error;
pub mod operator;
pub mod store;
pub mod stream;
pub mod telemetry;

mod timer;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use error::{CdcError, SerializationError, StateBackendError, StreamError};
pub use stream::{
    create_stream, BranchBuilder, ClosedBranch, ClosedStreamBuilder, ForkedStreamBuilder, Stream,
    StreamBuilder, StreamStatus,
};
pub use telemetry::{Counter, Histogram, Span, TelemetryProvider, TelemetryRef};

pub mod prelude {
    //! Everything a pipeline author usually needs.
    pub use crate::cdc::{CdcOperation, CdcRecord, CdcSettings, CdcSource};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::operator::window::{GlobalWindowKey, TimeMode, WindowKey};
    pub use crate::operator::{
        ChannelSource, CollectChannelSink, CollectVecSink, Emitter, ForEachSink, IteratorSource,
        Operator, SinkHandle, SourceOperator,
    };
    pub use crate::store::{InMemoryStore, SharedStore, StateStore};
    pub use crate::stream::{create_stream, Stream, StreamBuilder, StreamStatus};
    pub use crate::StreamError;
}
