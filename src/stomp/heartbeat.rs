use std::time::Duration;

/// Heart-beat intervals as carried by the `heart-beat` header.
///
/// `outgoing` is how often the sender promises to emit something, `incoming`
/// how often it wants to hear from its peer. Zero disables a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub outgoing: Duration,
    pub incoming: Duration,
}

impl Heartbeat {
    pub const DISABLED: Heartbeat = Heartbeat {
        outgoing: Duration::ZERO,
        incoming: Duration::ZERO,
    };

    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    pub fn from_millis(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(outgoing_ms),
            Duration::from_millis(incoming_ms),
        )
    }

    /// Parses a `cx,cy` header value in milliseconds.
    pub fn parse(value: &str) -> Option<Self> {
        let (outgoing, incoming) = value.split_once(',')?;
        let outgoing = outgoing.trim().parse::<u64>().ok()?;
        let incoming = incoming.trim().parse::<u64>().ok()?;
        Some(Self::from_millis(outgoing, incoming))
    }

    pub fn header_value(&self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }

    /// Combines what the client asked for with what the server answered in
    /// `CONNECTED`, from the client's point of view.
    ///
    /// The result's `outgoing` is the interval the client must send at and
    /// `incoming` the interval it may expect data at. Each direction is the
    /// larger of the two offers, or disabled when either side offers zero.
    pub fn negotiate(client: Heartbeat, server: Heartbeat) -> Heartbeat {
        Heartbeat {
            outgoing: combine(client.outgoing, server.incoming),
            incoming: combine(server.outgoing, client.incoming),
        }
    }
}

fn combine(ours: Duration, theirs: Duration) -> Duration {
    if ours.is_zero() || theirs.is_zero() {
        Duration::ZERO
    } else {
        ours.max(theirs)
    }
}
