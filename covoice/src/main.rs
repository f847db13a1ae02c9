use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use covoice::{SessionContext, SessionSettings, VoiceSession};
use covoice_core::config::GlarePolicy;
use covoice_core::{
    generate_id, logging, Config, LocalSignalBus, Participant, ParticipantId, RoomRoster,
};
use covoice_media::{
    AudioFrame, AudioOutput, CpalMicrophone, CpalSpeaker, MediaDevices, MicrophoneFeed,
    PushMicrophone, FRAME_SAMPLES, SAMPLE_RATE,
};
use covoice_rtc::WebRtcConnectionFactory;

#[derive(Parser, Debug)]
#[command(name = "covoice")]
#[command(about = "Runs a local voice room over loopback WebRTC", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, env = "COVOICE_CONFIG")]
    config: Option<String>,

    /// Number of synthetic participants in the room
    #[arg(long, default_value = "3")]
    participants: usize,

    /// How long to keep the room up
    #[arg(long, default_value = "10")]
    duration_secs: u64,

    /// Give the first participant the sound card instead of a test tone
    #[arg(long)]
    sound_card: bool,

    /// Capture device name, default device when omitted
    #[arg(long, requires = "sound_card")]
    input_device: Option<String>,

    /// Playback device name, default device when omitted
    #[arg(long, requires = "sound_card")]
    output_device: Option<String>,

    /// Offer collision handling; the room connects everybody at once so it
    /// needs a tie-break
    #[arg(long, default_value = "lower-id-offers", value_parser = ["ignore", "lower-id-offers"])]
    glare_policy: String,
}

/// Counts played frames and hands them on to the speaker, if any
#[derive(Default)]
struct FrameCounter {
    frames: AtomicU64,
    speaker: Option<Arc<dyn AudioOutput>>,
}

impl FrameCounter {
    fn with_speaker(speaker: Arc<dyn AudioOutput>) -> Self {
        Self {
            frames: AtomicU64::new(0),
            speaker: Some(speaker),
        }
    }
}

impl AudioOutput for FrameCounter {
    fn play(&self, participant: &ParticipantId, frame: AudioFrame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if let Some(speaker) = &self.speaker {
            speaker.play(participant, frame);
        }
    }
}

struct Member {
    session: VoiceSession,
    played: Arc<FrameCounter>,
}

/// Push a tone that is on for one second and off for the next
async fn feed_tone(feed: MicrophoneFeed, frequency: f32, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    let mut position: u64 = 0;
    let frames_per_second = u64::from(SAMPLE_RATE) / FRAME_SAMPLES as u64;
    let mut frame = 0_u64;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let voiced = (frame / frames_per_second) % 2 == 0;
                let samples: Vec<f32> = (0..FRAME_SAMPLES)
                    .map(|i| {
                        if voiced {
                            let t = (position + i as u64) as f32 / SAMPLE_RATE as f32;
                            0.3 * (TAU * frequency * t).sin()
                        } else {
                            0.0
                        }
                    })
                    .collect();
                feed.push(&samples);
                position += FRAME_SAMPLES as u64;
                frame += 1;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Configuration and logging
    let config = Config::load(args.config.as_deref())?;
    logging::init_logging(&config.logging)?;
    info!(
        participants = args.participants,
        duration_secs = args.duration_secs,
        sound_card = args.sound_card,
        glare_policy = %args.glare_policy,
        stun_servers = config.ice.stun_servers.len(),
        "covoice loopback room starting"
    );

    // 2. Room plumbing
    let bus = LocalSignalBus::new();
    let roster = Arc::new(RoomRoster::new());
    let connections = Arc::new(WebRtcConnectionFactory::new(config.ice.servers()));
    let mut settings = SessionSettings::from(&config);
    settings.glare_policy = match args.glare_policy.as_str() {
        "ignore" => GlarePolicy::Ignore,
        _ => GlarePolicy::LowerIdOffers,
    };
    let cancel = CancellationToken::new();

    // 3. Participants: join the room, then wire up a session each
    let mut members = Vec::with_capacity(args.participants);
    for n in 0..args.participants {
        let id = ParticipantId::from(format!("p{n}-{}", generate_id()));
        roster.join(Participant::new(id.clone()).with_display_name(format!("Speaker {n}")));

        let (devices, played): (Arc<dyn MediaDevices>, Arc<FrameCounter>) =
            if args.sound_card && n == 0 {
                let microphone = match &args.input_device {
                    Some(name) => CpalMicrophone::with_device(name.clone()),
                    None => CpalMicrophone::new(),
                };
                let speaker = CpalSpeaker::open(args.output_device.as_deref()).await?;
                info!(participant = %id, "Using the sound card");
                (
                    Arc::new(microphone),
                    Arc::new(FrameCounter::with_speaker(Arc::new(speaker))),
                )
            } else {
                let microphone = PushMicrophone::new();
                tokio::spawn(feed_tone(
                    microphone.feed(),
                    220.0 * (n as f32 + 1.0),
                    cancel.child_token(),
                ));
                (Arc::new(microphone), Arc::new(FrameCounter::default()))
            };

        let (endpoint, inbox) = bus.register(id.clone());
        let session = VoiceSession::new(
            id,
            settings.clone(),
            SessionContext {
                devices,
                connections: connections.clone(),
                signals: Arc::new(endpoint),
                presence: roster.clone(),
                output: played.clone(),
            },
        );
        session.attach(inbox, roster.subscribe());
        members.push(Member { session, played });
    }

    // 4. Connect everybody and watch the speaking indicators
    for member in &members {
        if let Err(e) = member.session.connect().await {
            error!(participant = %member.session.local_id(), error = %e, "Connect failed");
            continue;
        }
        let mut speaking = member.session.subscribe_speaking();
        let participant = member.session.local_id().clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = speaking.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now = *speaking.borrow_and_update();
                        info!(participant = %participant, speaking = now, "Speaking changed");
                    }
                }
            }
        });
    }

    // 5. Run until the deadline or Ctrl+C
    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Interrupted");
        }
    }

    for member in &members {
        for peer in member.session.peers() {
            info!(
                participant = %member.session.local_id(),
                peer = %peer.participant_id,
                role = %peer.role,
                state = %peer.state,
                "Peer summary"
            );
        }
        info!(
            participant = %member.session.local_id(),
            frames_played = member.played.frames.load(Ordering::Relaxed),
            "Playback summary"
        );
    }

    // 6. Tear down
    cancel.cancel();
    join_all(members.iter().map(|member| member.session.disconnect())).await;
    info!("covoice loopback room stopped");
    Ok(())
}
