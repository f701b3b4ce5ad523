//! The typed AMQP 1.0 performative model exchanged with the frame codec.
//!
//! These types describe *what* travels over a connection; encoding them to
//! and from the AMQP 1.0 binary format is entirely the job of the
//! [`FrameCodec`](crate::FrameCodec) implementation. Fields are restricted
//! to what the runtime's state machines consume.

/// The direction of a link, from the local point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// An AMQP error condition carried by Close, End, and Detach.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Condition {
    /// Symbolic condition name, e.g. `amqp:internal-error`.
    pub condition: String,
    /// Free-text description.
    pub description: String,
}

/// A terminal delivery state.
///
/// `Indeterminate` never appears on the wire: it is applied locally to
/// deliveries that were unsettled at the moment of a transport failure,
/// whose true fate at the broker cannot be known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
    Released,
    Modified { delivery_failed: bool },
    Indeterminate,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// Idle timeout in milliseconds; zero means no idle timeout.
    pub idle_timeout_ms: u32,
    pub properties: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Begin {
    /// Set by the responder to the channel number the initiator used.
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attach {
    pub name: String,
    pub handle: u32,
    pub role: Role,
    /// Address deliveries are taken from (meaningful for receivers).
    pub source: Option<String>,
    /// Address deliveries are sent to (meaningful for senders).
    pub target: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Flow {
    /// Absent for session-level flow, which this runtime emits but does not
    /// enforce.
    pub handle: Option<u32>,
    /// The sender's transfer count as known to the frame's emitter.
    pub delivery_count: u32,
    pub link_credit: u32,
    pub next_incoming_id: u32,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transfer {
    pub handle: u32,
    pub delivery_id: u32,
    pub delivery_tag: Vec<u8>,
    /// True if the sender settled the delivery up front (fire and forget).
    pub settled: bool,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Disposition {
    /// The role the *emitter* of the frame is playing.
    pub role: Role,
    pub first: u32,
    pub last: Option<u32>,
    pub settled: bool,
    pub state: Option<Outcome>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detach {
    pub handle: u32,
    /// True when the link is being closed rather than suspended.
    pub closed: bool,
    pub error: Option<Condition>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct End {
    pub error: Option<Condition>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Close {
    pub error: Option<Condition>,
}

/// A typed AMQP 1.0 protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    /// Short name used in log lines and protocol error reports.
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Begin(_) => "begin",
            Performative::Attach(_) => "attach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
            Performative::Disposition(_) => "disposition",
            Performative::Detach(_) => "detach",
            Performative::End(_) => "end",
            Performative::Close(_) => "close",
        }
    }
}
