// Session controller integration tests
//
// Sessions run against the in-memory signal bus, room roster and the
// scripted fake connections. Remote participants are either full sessions
// or simulated by a bare bus endpoint driven from the test.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use covoice::{SessionContext, SessionError, SessionSettings, VoiceSession};
use covoice_core::config::GlarePolicy;
use covoice_core::{
    BusEndpoint, IceCandidate, InboundSignal, LocalSignalBus, OutboundSignal, Participant,
    ParticipantId, Presence, RoomRoster, SignalChannel, SignalPayload,
};
use covoice_media::{
    AudioConstraints, AudioFrame, ChannelOutput, MediaAccessError, Permission, PushMicrophone,
    FRAME_SAMPLES,
};
use covoice_rtc::testing::FakeNetwork;
use covoice_rtc::{PeerRole, PeerState};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

struct Room {
    bus: LocalSignalBus,
    roster: Arc<RoomRoster>,
    network: FakeNetwork,
}

struct Member {
    session: VoiceSession,
    microphone: PushMicrophone,
    played: mpsc::UnboundedReceiver<(ParticipantId, AudioFrame)>,
}

struct Remote {
    endpoint: BusEndpoint,
    inbox: mpsc::UnboundedReceiver<InboundSignal>,
}

impl Room {
    fn new() -> Self {
        Self {
            bus: LocalSignalBus::new(),
            roster: Arc::new(RoomRoster::new()),
            network: FakeNetwork::new(),
        }
    }

    fn settings(glare_policy: GlarePolicy) -> SessionSettings {
        SessionSettings {
            constraints: AudioConstraints {
                noise_suppression: false,
                auto_gain_control: false,
                ..AudioConstraints::default()
            },
            glare_policy,
            ..SessionSettings::default()
        }
    }

    fn member(&self, id: &str) -> Member {
        self.member_with(id, Self::settings(GlarePolicy::LowerIdOffers))
    }

    fn member_with(&self, id: &str, settings: SessionSettings) -> Member {
        let participant = ParticipantId::from(id);
        self.roster.join(Participant::new(participant.clone()));
        let (endpoint, inbox) = self.bus.register(participant.clone());
        let microphone = PushMicrophone::new();
        let (output, played) = ChannelOutput::channel();

        let session = VoiceSession::new(
            participant,
            settings,
            SessionContext {
                devices: Arc::new(microphone.clone()),
                connections: Arc::new(self.network.factory(id)),
                signals: Arc::new(endpoint),
                presence: self.roster.clone(),
                output: Arc::new(output),
            },
        );
        session.attach(inbox, self.roster.subscribe());
        Member {
            session,
            microphone,
            played,
        }
    }

    /// A participant driven directly by the test
    fn remote(&self, id: &str) -> Remote {
        let participant = ParticipantId::from(id);
        self.roster.join(Participant::new(participant.clone()));
        let (endpoint, inbox) = self.bus.register(participant);
        Remote { endpoint, inbox }
    }
}

impl Remote {
    async fn send(&self, to: &str, payload: SignalPayload) {
        self.endpoint
            .send_signal(OutboundSignal {
                to: ParticipantId::from(to),
                payload,
            })
            .await
            .expect("signal delivered");
    }

    async fn next(&mut self) -> SignalPayload {
        tokio::time::timeout(WAIT, self.inbox.recv())
            .await
            .expect("signal in time")
            .expect("inbox open")
            .payload
    }

    async fn next_offer(&mut self) -> String {
        loop {
            if let SignalPayload::Offer { sdp } = self.next().await {
                return sdp;
            }
        }
    }
}

async fn until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn id(value: &str) -> ParticipantId {
    ParticipantId::from(value)
}

fn answer_from(participant: &str) -> SignalPayload {
    SignalPayload::Answer {
        sdp: format!("fake-answer {participant}"),
    }
}

fn candidate(n: u8) -> SignalPayload {
    SignalPayload::IceCandidate(IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 6000 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    })
}

/// Deterministic white noise
fn noise(len: usize, amplitude: f32, seed: u32) -> Vec<f32> {
    let mut state = seed.max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f32 / u32::MAX as f32 * 2.0 - 1.0) * amplitude
        })
        .collect()
}

async fn connect_with_remote(room: &Room, member: &Member, remote: &mut Remote, name: &str) {
    member.session.connect().await.expect("connect");
    remote.next_offer().await;
    remote.send("u", answer_from(name)).await;
    let connection = room.network.connection("u", name).expect("connection");
    until(|| connection.remote_description().is_some()).await;
    connection.emit_remote_track();
    until(|| member.session.is_playing(&id(name))).await;
}

#[tokio::test]
async fn test_example_scenario() {
    let room = Room::new();
    let mut u = room.member("u");
    let mut a = room.remote("a");

    // connect: one negotiating offerer record for A and an offer sent to A
    u.session.connect().await.expect("connect");
    let peers = u.session.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].participant_id, id("a"));
    assert_eq!(peers[0].role, PeerRole::Offerer);
    assert_eq!(peers[0].state, PeerState::Negotiating);
    assert_eq!(a.next_offer().await, "fake-offer u");

    // answer, then the remote stream: playback at full volume
    a.send("u", answer_from("a")).await;
    let connection = room.network.connection("u", "a").expect("connection");
    until(|| connection.remote_description().is_some()).await;
    let inbound = connection.emit_remote_track();
    until(|| u.session.is_playing(&id("a"))).await;
    assert_eq!(u.session.peer_state(&id("a")), Some(PeerState::Connected));
    assert_eq!(u.session.volume(), 100);
    assert_eq!(u.session.playback().element_volume(&id("a")), Some(100));

    // mute: still connected, local track disabled, A still audible
    assert!(u.session.toggle_mute());
    assert_eq!(u.session.peer_state(&id("a")), Some(PeerState::Connected));
    assert!(!u.session.local_track_enabled());
    inbound.push(AudioFrame::new(vec![0.5; FRAME_SAMPLES]));
    let (from, frame) = tokio::time::timeout(WAIT, u.played.recv())
        .await
        .expect("frame in time")
        .expect("output open");
    assert_eq!(from, id("a"));
    assert!((frame.samples[0] - 0.5).abs() < 1e-6);

    // disconnect: record gone, local tracks stopped
    u.session.disconnect().await;
    assert!(u.session.peers().is_empty());
    assert!(!u.session.is_connected());
    assert!(connection.is_closed());
    assert_eq!(connection.local_track_live(), Some(false));
    assert!(inbound.is_ended());
}

#[tokio::test]
async fn test_failure_is_isolated_per_peer() {
    let room = Room::new();
    let u = room.member("u");
    let mut remotes: Vec<Remote> = ["a", "b", "c"].iter().map(|r| room.remote(r)).collect();

    u.session.connect().await.expect("connect");
    for remote in &mut remotes {
        remote.next_offer().await;
    }
    assert_eq!(u.session.peers().len(), 3);

    room.network
        .connection("u", "b")
        .expect("connection")
        .fail("ice failed");
    until(|| u.session.peer_state(&id("b")) == Some(PeerState::Failed)).await;

    assert!(u.session.is_connected());
    assert_eq!(u.session.peer_state(&id("a")), Some(PeerState::Negotiating));
    assert_eq!(u.session.peer_state(&id("c")), Some(PeerState::Negotiating));

    // The remaining peers still complete
    remotes[2].send("u", answer_from("c")).await;
    let c = room.network.connection("u", "c").expect("connection");
    until(|| c.remote_description().is_some()).await;
    c.emit_remote_track();
    until(|| u.session.is_playing(&id("c"))).await;
    assert_eq!(u.session.peer_state(&id("b")), Some(PeerState::Failed));
    assert!(!u.session.is_playing(&id("b")));
}

#[tokio::test]
async fn test_failed_peer_stops_playback() {
    let room = Room::new();
    let u = room.member("u");
    let mut a = room.remote("a");
    connect_with_remote(&room, &u, &mut a, "a").await;

    room.network
        .connection("u", "a")
        .expect("connection")
        .fail("dtls alert");
    until(|| !u.session.is_playing(&id("a"))).await;
    assert_eq!(u.session.peer_state(&id("a")), Some(PeerState::Failed));
    assert!(u.session.is_connected());
}

#[tokio::test]
async fn test_connect_twice_acquires_once() {
    let room = Room::new();
    let u = room.member("u");
    let _a = room.remote("a");

    u.session.connect().await.expect("connect");
    assert_eq!(
        u.session.connect().await,
        Err(SessionError::AlreadyConnected)
    );
    assert_eq!(u.microphone.acquisitions(), 1);
    assert_eq!(u.session.peers().len(), 1);
}

#[tokio::test]
async fn test_concurrent_connect_acquires_once() {
    let room = Room::new();
    let u = room.member("u");

    let (first, second) = tokio::join!(u.session.connect(), u.session.connect());
    assert!(first.is_ok() != second.is_ok());
    assert_eq!(u.microphone.acquisitions(), 1);
}

#[tokio::test]
async fn test_media_access_errors_leave_session_disconnected() {
    let room = Room::new();
    let u = room.member("u");
    let _a = room.remote("a");

    u.microphone.set_permission(Permission::Denied);
    assert_eq!(
        u.session.connect().await,
        Err(SessionError::MediaAccess(MediaAccessError::PermissionDenied))
    );
    assert!(!u.session.is_connected());
    assert!(u.session.peers().is_empty());
    assert_eq!(room.network.created_count("u"), 0);

    u.microphone.set_permission(Permission::Granted);
    u.microphone.set_device_present(false);
    assert_eq!(
        u.session.connect().await,
        Err(SessionError::MediaAccess(MediaAccessError::NoDevice))
    );
    assert!(!u.session.is_connected());

    u.microphone.set_device_present(true);
    u.session.connect().await.expect("connect after fix");
    assert_eq!(u.microphone.acquisitions(), 1);
}

#[tokio::test]
async fn test_mute_and_deafen_are_orthogonal() {
    let room = Room::new();
    let mut u = room.member("u");
    let mut a = room.remote("a");
    connect_with_remote(&room, &u, &mut a, "a").await;
    let inbound = room.network.connection("u", "a").expect("connection").inbound();

    // mute alone keeps remote audio audible
    assert!(u.session.toggle_mute());
    assert!(!u.session.local_track_enabled());
    assert!(!u.session.is_deafened());
    assert_eq!(u.session.playback().element_muted(&id("a")), Some(false));
    assert!(!u.session.toggle_mute());
    assert!(u.session.local_track_enabled());

    // deafen alone keeps the local track enabled
    assert!(u.session.toggle_deafen());
    assert!(u.session.local_track_enabled());
    assert!(!u.session.is_muted());
    assert_eq!(u.session.playback().element_muted(&id("a")), Some(true));

    inbound.push(AudioFrame::new(vec![0.5; FRAME_SAMPLES]));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(u.played.try_recv().is_err());

    assert!(!u.session.toggle_deafen());
    u.session.set_volume(50);
    inbound.push(AudioFrame::new(vec![0.5; FRAME_SAMPLES]));
    let (_, frame) = tokio::time::timeout(WAIT, u.played.recv())
        .await
        .expect("frame in time")
        .expect("output open");
    assert!((frame.samples[0] - 0.25).abs() < 1e-6);
}

#[tokio::test]
async fn test_volume_is_clamped_and_kept() {
    let room = Room::new();
    let u = room.member("u");
    let mut a = room.remote("a");

    u.session.set_volume(150);
    assert_eq!(u.session.volume(), 100);
    u.session.set_volume(30);

    connect_with_remote(&room, &u, &mut a, "a").await;
    assert_eq!(u.session.playback().element_volume(&id("a")), Some(30));

    u.session.disconnect().await;
    assert_eq!(u.session.volume(), 30);
}

#[tokio::test]
async fn test_records_follow_presence() {
    let room = Room::new();
    let u = room.member("u");
    let _a = room.remote("a");
    let _b = room.remote("b");

    u.session.connect().await.expect("connect");
    let ids = |session: &VoiceSession| -> Vec<ParticipantId> {
        session
            .peers()
            .into_iter()
            .map(|peer| peer.participant_id)
            .collect()
    };
    assert_eq!(ids(&u.session), vec![id("a"), id("b")]);

    let _c = room.remote("c");
    until(|| ids(&u.session) == vec![id("a"), id("b"), id("c")]).await;

    room.roster.leave(&id("a"));
    until(|| ids(&u.session) == vec![id("b"), id("c")]).await;

    for _ in 0..2 {
        room.roster.join(Participant::new("a"));
        until(|| ids(&u.session).contains(&id("a"))).await;
        room.roster.leave(&id("a"));
        until(|| !ids(&u.session).contains(&id("a"))).await;
    }
    assert_eq!(ids(&u.session), vec![id("b"), id("c")]);
}

/// Roster that lets a join and a mute slip in right after connect reads it
struct InterruptedRoster {
    roster: Arc<RoomRoster>,
    session: OnceLock<VoiceSession>,
    interrupted: AtomicBool,
}

impl Presence for InterruptedRoster {
    fn participants(&self) -> Vec<Participant> {
        let snapshot = self.roster.participants();
        if let Some(session) = self.session.get() {
            if !self.interrupted.swap(true, Ordering::AcqRel) {
                let late = Participant::new("late");
                self.roster.join(late.clone());
                session.on_participant_joined(&late);
                session.toggle_mute();
            }
        }
        snapshot
    }
}

#[tokio::test]
async fn test_connect_keeps_join_and_mute_that_race_it() {
    let room = Room::new();
    let _a = room.remote("a");
    let (_late_endpoint, _late_inbox) = room.bus.register(id("late"));
    let presence = Arc::new(InterruptedRoster {
        roster: room.roster.clone(),
        session: OnceLock::new(),
        interrupted: AtomicBool::new(false),
    });

    room.roster.join(Participant::new("u"));
    let (endpoint, _inbox) = room.bus.register(id("u"));
    let (output, _played) = ChannelOutput::channel();
    let session = VoiceSession::new(
        id("u"),
        Room::settings(GlarePolicy::Ignore),
        SessionContext {
            devices: Arc::new(PushMicrophone::new()),
            connections: Arc::new(room.network.factory("u")),
            signals: Arc::new(endpoint),
            presence: presence.clone(),
            output: Arc::new(output),
        },
    );
    assert!(presence.session.set(session.clone()).is_ok());

    session.connect().await.expect("connect");
    assert!(presence.interrupted.load(Ordering::Acquire));

    assert!(session.is_muted());
    assert!(!session.local_track_enabled());
    assert!(!session.is_speaking());

    let peers: Vec<ParticipantId> = session
        .peers()
        .into_iter()
        .map(|peer| peer.participant_id)
        .collect();
    assert!(peers.contains(&id("a")));
    assert!(peers.contains(&id("late")));

    session.disconnect().await;
}

#[tokio::test]
async fn test_joined_while_disconnected_is_ignored() {
    let room = Room::new();
    let u = room.member("u");

    assert!(!u.session.on_participant_joined(&Participant::new("a")));
    assert!(!u.session.on_participant_left(&id("a")));
    assert!(u.session.peers().is_empty());
    assert_eq!(room.network.created_count("u"), 0);
}

#[tokio::test]
async fn test_disconnect_tears_everything_down() {
    let room = Room::new();
    let u = room.member("u");
    let mut a = room.remote("a");
    let mut b = room.remote("b");
    connect_with_remote(&room, &u, &mut a, "a").await;
    b.next_offer().await;

    u.session.toggle_mute();
    u.session.toggle_deafen();
    u.session.disconnect().await;

    assert!(!u.session.is_connected());
    assert!(u.session.peers().is_empty());
    assert!(!u.session.local_stream_active());
    assert!(!u.session.is_muted());
    assert!(!u.session.is_deafened());
    assert!(!u.session.is_speaking());
    assert!(u.session.playback().is_empty());
    for remote in ["a", "b"] {
        let connection = room.network.connection("u", remote).expect("connection");
        assert!(connection.is_closed());
        assert_eq!(connection.local_track_live(), Some(false));
    }

    // Safe to repeat, and signals are dropped while disconnected
    u.session.disconnect().await;
    a.send("u", answer_from("a")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(u.session.peers().is_empty());
}

#[tokio::test]
async fn test_candidate_before_answer_is_not_lost() {
    let room = Room::new();
    let u = room.member("u");
    let mut a = room.remote("a");

    u.session.connect().await.expect("connect");
    a.next_offer().await;
    let connection = room.network.connection("u", "a").expect("connection");

    a.send("u", candidate(1)).await;
    until(|| connection.buffered_candidates().len() == 1).await;

    a.send("u", answer_from("a")).await;
    until(|| connection.applied_candidates().len() == 1).await;
    assert!(connection.buffered_candidates().is_empty());

    connection.emit_remote_track();
    until(|| u.session.is_playing(&id("a"))).await;
    assert_eq!(u.session.peer_state(&id("a")), Some(PeerState::Connected));
}

#[tokio::test]
async fn test_two_sessions_exchange_audio() {
    let room = Room::new();
    let a = room.member("a");
    let mut u = room.member("u");

    a.session.connect().await.expect("connect a");
    u.session.connect().await.expect("connect u");

    until(|| a.session.peer_state(&id("u")) == Some(PeerState::Connected)).await;
    until(|| u.session.peer_state(&id("a")) == Some(PeerState::Connected)).await;
    // "a" sorts first, so it keeps offering and "u" answers
    assert_eq!(
        a.session.peers().first().map(|peer| peer.role),
        Some(PeerRole::Offerer)
    );
    assert_eq!(
        u.session.peers().first().map(|peer| peer.role),
        Some(PeerRole::Answerer)
    );
    until(|| u.session.is_playing(&id("a"))).await;

    let feed = a.microphone.feed();
    let heard = tokio::time::timeout(WAIT, async {
        loop {
            feed.push(&[0.2; FRAME_SAMPLES]);
            tokio::select! {
                played = u.played.recv() => break played,
                () = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    })
    .await
    .expect("audio from a in time")
    .expect("output open");
    assert_eq!(heard.0, id("a"));
}

#[tokio::test]
async fn test_glare_ignored_keeps_both_offers() {
    let room = Room::new();
    let a = room.member_with("a", Room::settings(GlarePolicy::Ignore));
    let u = room.member_with("u", Room::settings(GlarePolicy::Ignore));

    a.session.connect().await.expect("connect a");
    u.session.connect().await.expect("connect u");
    tokio::time::sleep(Duration::from_millis(200)).await;

    for (session, other) in [(&a.session, "u"), (&u.session, "a")] {
        let peers = session.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].participant_id, id(other));
        assert_eq!(peers[0].role, PeerRole::Offerer);
        assert_eq!(peers[0].state, PeerState::Negotiating);
        assert!(peers[0].awaiting_answer);
    }
}

#[tokio::test]
async fn test_retry_failed_peer() {
    let room = Room::new();
    let u = room.member("u");
    let mut a = room.remote("a");

    u.session.connect().await.expect("connect");
    a.next_offer().await;
    assert!(!u.session.retry_peer(&id("a")));

    room.network
        .connection("u", "a")
        .expect("connection")
        .fail("timeout");
    until(|| u.session.peer_state(&id("a")) == Some(PeerState::Failed)).await;

    assert!(u.session.retry_peer(&id("a")));
    assert_eq!(u.session.peer_state(&id("a")), Some(PeerState::Negotiating));
    assert_eq!(a.next_offer().await, "fake-offer u");
    assert_eq!(room.network.created_count("u"), 2);
}

#[tokio::test]
async fn test_speaking_follows_input_and_mute() {
    let room = Room::new();
    let u = room.member("u");
    u.session.connect().await.expect("connect");
    let feed = u.microphone.feed();
    let mut speaking = u.session.subscribe_speaking();

    let talk = {
        let feed = feed.clone();
        tokio::spawn(async move {
            let mut seed = 1;
            loop {
                feed.push(&noise(FRAME_SAMPLES, 0.5, seed));
                seed += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    tokio::time::timeout(WAIT, speaking.wait_for(|now| *now))
        .await
        .expect("speaking in time")
        .expect("speaking channel open");
    assert!(u.session.is_speaking());

    u.session.toggle_mute();
    assert!(!u.session.is_speaking());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!u.session.is_speaking());

    u.session.toggle_mute();
    tokio::time::timeout(WAIT, speaking.wait_for(|now| *now))
        .await
        .expect("speaking again in time")
        .expect("speaking channel open");

    talk.abort();
    u.session.disconnect().await;
    assert!(!u.session.is_speaking());
}
