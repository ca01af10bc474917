//! One-to-one audio/video calls signaled through the `call_signals` store.

pub mod channel;
pub mod error;
pub mod loopback;
pub mod manager;
pub mod media;
pub mod notify;
pub mod peer;
pub mod recovery;
pub mod session;
pub mod state;

pub use channel::{ChannelSink, SignalChannel, SignalSubscription};
pub use error::{CallError, MediaError, MediaFailure, SessionError, TransportError};
pub use manager::{CallBackends, CallHandle, CallManager};
pub use media::{MediaDevices, MediaStream, MediaTrack};
pub use notify::{CallNotifier, LogNotificationSink, Notification, NotificationSink};
pub use peer::{ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent};
pub use recovery::RecoveryManager;
pub use session::{PeerSession, SignalSink};
pub use state::{CallState, ConnectionQuality, FailedCall, PendingCall};
