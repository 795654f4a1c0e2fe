//! Event loop driving the signaling core
//!
//! Owns the relay client, the WebRTC engine and the preference store, and
//! shuttles inputs and outputs between them and [`Signaling`]. Line
//! commands read from stdin stand in for the chat UI.
//!
//! The camera carries whatever RTP arrives on `webrtc.video_rtp_listen` and
//! `webrtc.audio_rtp_listen`, e.g. from
//! `ffmpeg -re -f v4l2 -i /dev/video0 -c:v libvpx -deadline realtime -f rtp rtp://127.0.0.1:5004`.

use crate::config::Config;
use crate::prefs::{JsonPreferences, MemoryPreferences, Preference, PreferenceStore};
use crate::signaling::{Command, Input, Output, Signaling, TrackKind};
use crate::transport::{RelayClient, RelayEvent, RelayHandle};
use crate::webrtc::RtcEngine;
use log::{debug, error, info, warn};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// One parsed stdin line
#[derive(Debug, Clone, PartialEq)]
pub enum LineCommand {
    Core(Command),
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "commands: open|close|boot|unboot|invite|mute|unmute|audio|popout <user>, \
close-all, mute-all, camera on|off|switch, mic, pref <name> on|off, sweep, status, quit";

/// Parse a stdin command line
pub fn parse_line(line: &str) -> Result<LineCommand, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".to_string());
    };
    let arg = words.next();
    let user = || {
        arg.map(|u| u.trim_start_matches('@').to_string())
            .ok_or_else(|| format!("usage: {} <username>", verb))
    };

    let command = match verb {
        "open" => Command::OpenVideo { username: user()? },
        "close" => Command::CloseVideo { username: user()? },
        "close-all" => Command::CloseOpenVideos,
        "boot" => Command::Boot { username: user()? },
        "unboot" => Command::Unboot { username: user()? },
        "invite" => Command::InviteVideo { username: user()? },
        "mute" => Command::SetUserMuted { username: user()?, muted: true },
        "unmute" => Command::SetUserMuted { username: user()?, muted: false },
        "audio" => Command::ToggleMuteVideo { username: user()? },
        "mute-all" => Command::MuteAllVideos,
        "popout" => Command::TogglePopOut { username: user()? },
        "camera" => match arg {
            Some("on") => Command::StartCamera,
            Some("off") => Command::StopCamera,
            Some("switch") => Command::ChangeCamera,
            _ => return Err("usage: camera on|off|switch".to_string()),
        },
        "mic" => Command::ToggleMicrophone,
        "pref" => {
            let name = arg.ok_or_else(|| "usage: pref <name> on|off".to_string())?;
            let pref = Preference::parse(name).ok_or_else(|| format!("unknown preference {}", name))?;
            let value = match words.next() {
                Some("on") | Some("true") => true,
                Some("off") | Some("false") => false,
                _ => return Err("usage: pref <name> on|off".to_string()),
            };
            Command::SetPreference { pref, value }
        }
        "sweep" => Command::Sweep,
        "status" => return Ok(LineCommand::Status),
        "help" => return Ok(LineCommand::Help),
        "quit" | "exit" => return Ok(LineCommand::Quit),
        other => return Err(format!("unknown command {}", other)),
    };
    Ok(LineCommand::Core(command))
}

/// Webcam client bound to one relay account
pub struct Client {
    core: Signaling,
    prefs: Box<dyn PreferenceStore>,
    relay: Option<RelayHandle>,
    engine: Option<RtcEngine>,
}

impl Client {
    pub fn new(config: &Config) -> Self {
        let prefs: Box<dyn PreferenceStore> = match &config.preferences.path {
            Some(path) => Box::new(JsonPreferences::open(path.clone())),
            None => Box::new(MemoryPreferences::default()),
        };

        let mut core = Signaling::new(config.signaling_config());
        let stored = prefs.stored();
        debug!("Loaded {} stored preferences", stored.len());
        core.load_preferences(stored);

        Self {
            core,
            prefs,
            relay: None,
            engine: None,
        }
    }

    /// Run until quit, ctrl-c or the relay gives up
    pub async fn run(mut self, config: Config, start_camera: bool) -> Result<(), Box<dyn std::error::Error>> {
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        self.relay = Some(RelayClient::new(config.relay.clone()).spawn(relay_tx));

        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel();
        let engine = RtcEngine::new(&config.webrtc, engine_tx);
        let sources = [
            (&config.webrtc.video_rtp_listen, TrackKind::Video),
            (&config.webrtc.audio_rtp_listen, TrackKind::Audio),
        ];
        for (addr, kind) in sources {
            if let Some(addr) = addr {
                engine.listen_rtp(addr, kind).await?;
            }
        }
        if config.webrtc.video_rtp_listen.is_none() {
            warn!("No video_rtp_listen configured, the camera will send no video");
        }
        self.engine = Some(engine);

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });
        let mut stdin_open = true;

        if start_camera {
            self.feed(Input::Command(Command::StartCamera));
        }

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            let deadline = self.core.poll_timeout();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = relay_rx.recv() => match event {
                    Some(RelayEvent::Connected) => self.feed(Input::RelayConnected),
                    Some(RelayEvent::Disconnected) => self.feed(Input::RelayDisconnected),
                    Some(RelayEvent::Message(message)) => self.feed(Input::Relay(message)),
                    Some(RelayEvent::GaveUp) => {
                        error!("Relay connection lost for good");
                        break;
                    }
                    None => {
                        info!("Relay client stopped");
                        break;
                    }
                },
                Some(event) = engine_rx.recv() => self.feed(Input::Engine(event)),
                line = line_rx.recv(), if stdin_open => match line {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match parse_line(&line) {
                        Ok(LineCommand::Core(command)) => self.feed(Input::Command(command)),
                        Ok(LineCommand::Status) => self.log_status(),
                        Ok(LineCommand::Help) => info!("{}", HELP),
                        Ok(LineCommand::Quit) => break,
                        Err(e) => warn!("{}", e),
                    },
                    None => {
                        debug!("stdin closed");
                        stdin_open = false;
                    }
                },
                _ = timer => self.feed(Input::Timeout),
                _ = &mut shutdown => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        self.feed(Input::Command(Command::StopCamera));
        if let Some(engine) = self.engine.as_mut() {
            engine.shutdown();
        }
        if let Some(relay) = self.relay.as_ref() {
            relay.close();
        }
        Ok(())
    }

    fn feed(&mut self, input: Input) {
        self.core.handle_input(Instant::now(), input);
        self.flush();
    }

    fn flush(&mut self) {
        while let Some(output) = self.core.poll_output() {
            match output {
                Output::Send(message) => match self.relay.as_ref() {
                    Some(relay) => {
                        if let Err(e) = relay.send(message) {
                            warn!("{}", e);
                        }
                    }
                    None => debug!("No relay for {}", message.action()),
                },
                Output::Engine(command) => match self.engine.as_mut() {
                    Some(engine) => engine.dispatch(command),
                    None => debug!("No engine for {:?}", command),
                },
                Output::Notice(notice) => info!("{}", notice),
                Output::StorePreference(pref, value) => {
                    if let Err(e) = self.prefs.set(pref, value) {
                        warn!("Failed to store {}: {}", pref.key(), e);
                    }
                }
            }
        }
    }

    fn log_status(&self) {
        let camera = self.core.camera();
        info!(
            "camera {} flags {:#x}, {} peers online",
            if camera.active { "on" } else { "off" },
            self.core.my_video_flags().bits(),
            self.core.directory().len()
        );
        for session in self.core.registry().sessions() {
            info!(
                "  {}: offerer={:?} answerer={:?} watching_me={} frozen={}",
                session.username,
                session.offerer.as_ref().map(|c| c.state),
                session.answerer.as_ref().map(|c| c.state),
                session.watching_me,
                session.health.is_frozen()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_commands() {
        assert_eq!(
            parse_line("open @bob"),
            Ok(LineCommand::Core(Command::OpenVideo { username: "bob".to_string() }))
        );
        assert_eq!(
            parse_line("  unmute carol "),
            Ok(LineCommand::Core(Command::SetUserMuted { username: "carol".to_string(), muted: false }))
        );
        assert!(parse_line("boot").is_err());
    }

    #[test]
    fn parses_camera_and_preferences() {
        assert_eq!(parse_line("camera switch"), Ok(LineCommand::Core(Command::ChangeCamera)));
        assert!(parse_line("camera sideways").is_err());
        assert_eq!(
            parse_line("pref mutual-open on"),
            Ok(LineCommand::Core(Command::SetPreference { pref: Preference::MutualOpen, value: true }))
        );
        assert!(parse_line("pref mutual maybe").is_err());
        assert!(parse_line("pref shoesize on").is_err());
        assert_eq!(parse_line("quit"), Ok(LineCommand::Quit));
        assert!(parse_line("dance").is_err());
    }

    #[test]
    fn stored_preferences_reach_the_core() {
        let path = std::env::temp_dir().join(format!("peercam-client-{}.json", uuid::Uuid::new_v4()));
        JsonPreferences::open(path.clone()).set(Preference::Explicit, true).unwrap();

        let mut config = Config::default();
        config.relay.username = "alice".to_string();
        config.preferences.path = Some(path.clone());
        let client = Client::new(&config);
        assert!(client.core.camera().nsfw);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn preference_changes_are_persisted() {
        let mut config = Config::default();
        config.relay.username = "alice".to_string();
        let mut client = Client::new(&config);
        client.feed(Input::Command(Command::SetPreference { pref: Preference::Mutual, value: true }));
        assert_eq!(client.prefs.get(Preference::Mutual), Some(true));
    }

    #[tokio::test]
    async fn camera_round_trips_through_engine() {
        let mut config = Config::default();
        config.relay.username = "alice".to_string();
        let mut client = Client::new(&config);

        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel();
        client.engine = Some(RtcEngine::new(&config.webrtc, engine_tx));

        client.feed(Input::Command(Command::StartCamera));
        match engine_rx.recv().await {
            Some(event) => client.feed(Input::Engine(event)),
            None => panic!("engine dropped"),
        }
        assert!(client.core.camera().active);
        assert!(client.engine.as_ref().unwrap().local_media().is_some());

        client.feed(Input::Command(Command::StopCamera));
        assert!(!client.core.camera().active);
        assert!(client.engine.as_ref().unwrap().local_media().is_none());
    }
}
