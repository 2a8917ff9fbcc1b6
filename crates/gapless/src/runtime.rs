//! Tick loop driving the player, plus the stdin command console.

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use cpal::traits::DeviceTrait;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use gapless_player::codec::aac::AacCodec;
use gapless_player::net::TcpConnector;
use gapless_player::playback::CpalSink;
use gapless_player::{AudioPlayer, device};
use gapless_types::PipelineStatus;

use crate::config::Settings;
use crate::events::ConsoleEvents;

/// One console instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    TogglePause,
    Play,
    Stop,
    Next,
    Previous,
    VolumeUp,
    VolumeDown,
    Status,
    Quit,
}

/// Parse one console line. Unknown input yields `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let cmd = match line.trim().to_ascii_lowercase().as_str() {
        "" | "p" | "pause" => Command::TogglePause,
        "g" | "play" => Command::Play,
        "s" | "stop" => Command::Stop,
        "n" | "next" => Command::Next,
        "b" | "prev" | "previous" => Command::Previous,
        "+" | "up" => Command::VolumeUp,
        "-" | "down" => Command::VolumeDown,
        "i" | "status" => Command::Status,
        "q" | "quit" | "exit" => Command::Quit,
        _ => return None,
    };
    Some(cmd)
}

const HELP: &str =
    "commands: [enter]/p pause  g play  s stop  n next  b previous  +/- volume  i status  q quit";

fn spawn_console(tx: Sender<Command>) -> Result<()> {
    std::thread::Builder::new()
        .name("gapless-console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Some(cmd) => {
                        if tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    None => println!("{HELP}"),
                }
            }
            tracing::debug!("console input closed");
        })
        .context("spawn console thread")?;
    Ok(())
}

/// Play the configured playlist until it finishes or the user quits.
pub fn run(settings: Settings) -> Result<()> {
    if settings.tracks.is_empty() {
        bail!("playlist is empty; pass track URLs or a --config with [[tracks]]");
    }

    let host = cpal::default_host();
    let device = device::pick_device(&host, settings.device.as_deref())?;
    tracing::info!(device = %device.description()?, "output device");

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        let _ = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        });
    }

    let cfg = settings.pipeline.clone();
    let events = if settings.console {
        ConsoleEvents::default()
    } else {
        ConsoleEvents::quiet()
    };
    let mut player = AudioPlayer::new(
        cfg.clone(),
        TcpConnector::new(cfg.connect_timeout),
        AacCodec::new(),
        CpalSink::new(device, cfg.play_chunk_bytes),
        Box::new(events),
    )?;

    let titles: Vec<&str> = settings.tracks.iter().map(|t| t.title.as_str()).collect();
    let urls: Vec<&str> = settings.tracks.iter().map(|t| t.url.as_str()).collect();
    player.set_playlist(&titles, &urls)?;
    player.set_volume(settings.volume)?;

    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
    if settings.console {
        spawn_console(cmd_tx)?;
        println!("{HELP}");
    } else {
        drop(cmd_tx);
    }

    player.play();
    tracing::info!(
        tracks = settings.tracks.len(),
        tick_ms = settings.tick.as_millis() as u64,
        "playback started"
    );

    let mut user_stopped = false;
    loop {
        let tick_start = Instant::now();
        if interrupted.load(Ordering::SeqCst) {
            tracing::info!("interrupted");
            break;
        }

        player.audio_pump().context("audio pump")?;

        if player.is_stopped() && !user_stopped {
            tracing::info!(underruns = player.sink().underruns(), "playlist finished");
            break;
        }

        let deadline = tick_start + settings.tick;
        match drain_commands(&cmd_rx, deadline, &mut player, &mut user_stopped)? {
            Flow::Quit => break,
            Flow::Continue => {}
        }
    }

    player.stop();
    Ok(())
}

enum Flow {
    Continue,
    Quit,
}

type Player = AudioPlayer<TcpConnector, AacCodec, CpalSink>;

/// Apply commands that arrive before `deadline`; returns once the tick is used up.
fn drain_commands(
    rx: &Receiver<Command>,
    deadline: Instant,
    player: &mut Player,
    user_stopped: &mut bool,
) -> Result<Flow> {
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(Command::Quit) => return Ok(Flow::Quit),
            Ok(cmd) => apply_command(player, cmd, user_stopped)?,
            Err(RecvTimeoutError::Timeout) => return Ok(Flow::Continue),
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                return Ok(Flow::Continue);
            }
        }
    }
}

fn apply_command(player: &mut Player, cmd: Command, user_stopped: &mut bool) -> Result<()> {
    match cmd {
        Command::TogglePause => {
            if player.is_playing() {
                player.pause();
            } else {
                *user_stopped = false;
                player.play();
            }
        }
        Command::Play => {
            *user_stopped = false;
            player.play();
        }
        Command::Stop => {
            *user_stopped = true;
            player.stop();
        }
        Command::Next => player.ffwd(),
        Command::Previous => player.rewind(),
        Command::VolumeUp => step_volume(player, 1)?,
        Command::VolumeDown => step_volume(player, -1)?,
        Command::Status => println!("{}", format_status(&player.status())),
        Command::Quit => {}
    }
    Ok(())
}

fn step_volume(player: &mut Player, delta: i8) -> Result<()> {
    let next = player.get_volume().saturating_add_signed(delta).clamp(1, 11);
    if next != player.get_volume() {
        player.set_volume(next)?;
    }
    println!("  volume {next}");
    Ok(())
}

fn format_status(status: &PipelineStatus) -> String {
    let format = status
        .sink_format
        .map(|f| f.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "  {:?} vol {} | now {} | next {} | in {}/{} out {}/{} | read {} decoded {} played {} | sink {} | starved {}",
        status.state,
        status.volume,
        status.current_title.as_deref().unwrap_or("-"),
        status.next_title.as_deref().unwrap_or("-"),
        status.in_buffered,
        status.in_capacity,
        status.out_buffered,
        status.out_capacity,
        status.tracks_read,
        status.tracks_decoded,
        status.tracks_played,
        format,
        status.starvations,
    )
}
