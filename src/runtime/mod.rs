pub mod config;
pub mod context;
pub mod daemon;
pub mod ids;
pub mod net;
pub mod sim;
pub mod thread;

// Every exchange between processes belongs to a logical thread: a single
// causally ordered chain of nested requests and responses, named by an id that
// travels with every envelope. Each process runs one task per logical thread it
// takes part in. The task owns the logical thread's call stack and is the only
// code that ever touches it, so no locks guard conversation state. Other tasks
// talk to it exclusively through its queue.

// A logical thread that sends a request does not simply park until the answer
// shows up. It keeps draining its queue and services any request that arrives
// in the meantime, because the peer it called may well call back into it as
// part of producing that answer. Nested requests therefore unwind in the same
// order they were made, on whichever processes they happen to visit.

// The registry mapping ids to running logical threads is the one structure
// shared between connections. Receivers only read it on the hot path; a write
// lock is taken when a conversation is joined, initiated or finished.

// Simulations coordinate through a lock state machine owned by a dedicated
// logical thread. Lock requests from every conversation funnel into that
// thread's queue, so the state machine itself stays single threaded and
// deterministic.
