use chatcall::callcore::{CallPhase, CallType};
use chatcall::calls::{
    CallBackends, CallError, CallHandle, CallManager, LogNotificationSink, loopback,
};
use chatcall::config::CallConfig;
use chatcall::store::MemorySignalStore;
use chrono::{Local, Utc};
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

// Walks two in-process users through one call over the in-memory signal
// store and loopback peer connections.
//
// Usage:
//   cargo run                        # audio call, accepted
//   cargo run -- --video             # video call
//   cargo run -- --reject            # callee declines
//   cargo run -- --hold 5            # stay in the call for 5 seconds

#[derive(Parser, Debug)]
#[command(about = "Place a demo call between two local users")]
struct Args {
    /// Place a video call instead of an audio call
    #[arg(long)]
    video: bool,

    /// Have the callee decline the call
    #[arg(long)]
    reject: bool,

    /// Caller display name sent with the call request
    #[arg(short, long, default_value = "Alice")]
    name: String,

    /// Seconds to stay in the call before hanging up
    #[arg(long, default_value_t = 2)]
    hold: u64,
}

const CALLER: &str = "user-a";
const CALLEE: &str = "user-b";
const CONVERSATION: &str = "conv-demo";
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        if let Err(e) = run(args).await {
            error!("Demo call failed: {e}");
        }
    });
}

fn backends(store: &Arc<MemorySignalStore>) -> CallBackends {
    CallBackends {
        store: store.clone(),
        peers: Arc::new(loopback::LoopbackPeerFactory::new()),
        devices: Arc::new(loopback::LoopbackMediaDevices::new()),
        notifications: Arc::new(LogNotificationSink),
    }
}

async fn wait_for_phase(handle: &CallHandle, phase: CallPhase) -> Result<(), CallError> {
    match tokio::time::timeout(STEP_TIMEOUT, handle.wait_for(|s| s.phase == phase)).await {
        Ok(state) => state.map(|_| ()),
        Err(_) => {
            warn!("{} never reached {phase}", handle.local_user());
            Err(CallError::NotActive)
        }
    }
}

async fn run(args: Args) -> Result<(), CallError> {
    let store = Arc::new(MemorySignalStore::new());
    let config = CallConfig::from_env();

    let caller =
        CallManager::new(CALLER, config.clone().with_caller_name(&args.name), backends(&store))
            .spawn();
    let callee = CallManager::new(CALLEE, config.with_caller_name("Bob"), backends(&store)).spawn();
    let mut caller_errors = caller.errors();

    // Let both listeners subscribe before the first signal goes out.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let call_type = if args.video {
        CallType::Video
    } else {
        CallType::Audio
    };
    info!("{CALLER} calls {CALLEE} ({call_type})");
    caller.start_call(CALLEE, CONVERSATION, call_type).await?;
    wait_for_phase(&callee, CallPhase::IncomingRinging).await?;

    if args.reject {
        callee.reject_call().await?;
        wait_for_phase(&caller, CallPhase::Idle).await?;
        if let Ok(info) = caller_errors.try_recv() {
            info!("{CALLER} was told: {}", info.display_message());
        }
        return Ok(());
    }

    callee.accept_call().await?;
    wait_for_phase(&caller, CallPhase::InCall).await?;
    wait_for_phase(&callee, CallPhase::InCall).await?;

    let state = caller.state();
    info!(
        "Connected: quality {:?}, local tracks {}, remote tracks {}",
        state.connection_quality(),
        state.local_stream.map(|s| s.tracks().len()).unwrap_or(0),
        state.remote_stream.map(|s| s.tracks().len()).unwrap_or(0)
    );

    if args.video {
        caller.start_screen_share().await?;
        info!("{CALLER} is sharing their screen");
    }
    let muted = !caller.toggle_microphone().await?;
    info!("{CALLER} microphone muted: {muted}");

    tokio::time::sleep(Duration::from_secs(args.hold)).await;
    if let Some(duration) = caller.state().duration(Utc::now()) {
        info!("Call duration {duration}");
    }

    caller.end_call().await?;
    wait_for_phase(&callee, CallPhase::Idle).await?;
    info!("Both sides are idle again");
    Ok(())
}
