//! NovelMind game launcher.
//!
//! Boots a shipped game from its base directory: logging, configuration with
//! user overrides, resource packs, localization, and finally the compiled
//! script, then drives the script runtime from a terminal front end (the
//! graphical presentation layer is a separate host; this binary is the
//! reference runtime). Every initialization step carries a stable error code
//! so failures are diagnosable from the player's screen.

mod error;
mod locale;

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use error::{
    LauncherError, INIT_CONFIG, INIT_DIRS, INIT_INPUT, INIT_LOCALE, INIT_LOG, INIT_PACKS,
    INIT_SAVE, INIT_SCRIPT, RUNTIME,
};
use locale::LocalizationManager;
use nm_bytecode::{CharacterDecl, CompiledScript};
use nm_config::{PacksIndex, RuntimeConfig};
use nm_pack::crypto::{self, CryptoError};
use nm_pack::{COMPILED_SCRIPTS_PATH, ENV_PUBLIC_KEY};
use nm_runtime::{RuntimeState, ScriptEvent, ScriptEventKind, ScriptRuntime};
use nm_vfs::{MultiPackVfs, PackType};
use nm_vm::VmDebugger;

/// CLI arguments (developer overrides; players normally pass nothing).
#[derive(Parser, Debug)]
#[command(name = "novelmind", version, about = "NovelMind visual novel runtime")]
struct Args {
    /// Game base path (defaults to the current directory).
    pub base_path: Option<PathBuf>,
    /// Override the base config file path.
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Override the locale.
    #[arg(long = "lang")]
    pub lang: Option<String>,
    /// Override the start scene.
    #[arg(long = "scene")]
    pub scene: Option<String>,
    /// Enable debug mode (attaches the VM debugger).
    #[arg(long = "debug")]
    pub debug: bool,
    /// Debug-level logging.
    #[arg(long = "verbose")]
    pub verbose: bool,
    /// Force windowed mode.
    #[arg(long = "windowed")]
    pub windowed: bool,
}

fn main() {
    std::process::exit(launch());
}

fn launch() -> i32 {
    let args = Args::parse();
    let mut launcher = Launcher::new(args);
    if let Err(err) = launcher.initialize() {
        // Logging may not be up yet; the player gets stderr either way.
        eprintln!("{err}");
        error!(target: "runtime", code = err.code, message = %err.message, "initialization failed");
        return 1;
    }
    launcher.run()
}

struct Launcher {
    args: Args,
    base_path: PathBuf,
    config: RuntimeConfig,
    vfs: MultiPackVfs,
    l10n: Option<LocalizationManager>,
    runtime: ScriptRuntime,
    characters: BTreeMap<String, CharacterDecl>,
    log_guard: Option<WorkerGuard>,
}

impl Launcher {
    fn new(args: Args) -> Self {
        let base_path = args
            .base_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            args,
            base_path,
            config: RuntimeConfig::default(),
            vfs: MultiPackVfs::new(),
            l10n: None,
            runtime: ScriptRuntime::new(),
            characters: BTreeMap::new(),
            log_guard: None,
        }
    }

    fn initialize(&mut self) -> Result<(), LauncherError> {
        self.init_logging()?;
        Self::install_panic_hook();
        info!(target: "runtime", base = %self.base_path.display(), "startup");
        self.init_config()?;
        self.init_directories()?;
        self.init_packs()?;
        self.init_input()?;
        self.init_save()?;
        self.init_locale()?;
        self.init_script()?;
        info!(target: "runtime", "initialization complete");
        Ok(())
    }

    fn init_logging(&mut self) -> Result<(), LauncherError> {
        let log_dir = self.base_path.join("logs");
        std::fs::create_dir_all(&log_dir).map_err(|e| {
            LauncherError::new(INIT_LOG, "cannot create the logs directory")
                .with_details(format!("{}: {e}", log_dir.display()))
                .with_suggestion("check that the game directory is writable")
        })?;
        let appender = tracing_appender::rolling::never(&log_dir, "game.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let default_level = if self.args.verbose { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .try_init()
            .map_err(|e| {
                LauncherError::new(INIT_LOG, "failed to initialize logging")
                    .with_details(e.to_string())
            })?;
        self.log_guard = Some(guard);
        Ok(())
    }

    fn install_panic_hook() {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            error!(target: "runtime", %panic_info, "panic");
            default_hook(panic_info);
        }));
    }

    fn init_config(&mut self) -> Result<(), LauncherError> {
        let base_config = self
            .args
            .config
            .clone()
            .unwrap_or_else(|| self.base_path.join("config").join("runtime_config.json"));
        let user_config = self.base_path.join("config").join("runtime_user.json");

        self.config = if base_config.exists() {
            RuntimeConfig::load_with_user(&base_config, &user_config).map_err(|e| {
                LauncherError::new(INIT_CONFIG, "the game configuration could not be read")
                    .with_details(e.to_string())
                    .with_suggestion("restore config/runtime_config.json or reinstall the game")
            })?
        } else {
            warn!(target: "runtime", path = %base_config.display(),
                "no runtime_config.json; using defaults");
            RuntimeConfig::default()
        };

        if let Some(lang) = &self.args.lang {
            self.config.localization.current_locale = lang.clone();
        }
        if self.args.windowed {
            self.config.window.fullscreen = false;
        }
        if self.args.debug {
            self.config.debug.enable_debug_console = true;
        }
        info!(
            target: "runtime",
            game = %self.config.game.name,
            locale = %self.config.localization.current_locale,
            fullscreen = self.config.window.fullscreen,
            "configuration loaded"
        );
        Ok(())
    }

    fn init_directories(&self) -> Result<(), LauncherError> {
        for dir in [
            "config",
            self.config.saves.directory.as_str(),
            self.config.logging.log_directory.as_str(),
        ] {
            let path = self.base_path.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| {
                LauncherError::new(INIT_DIRS, "cannot create a required game directory")
                    .with_details(format!("{}: {e}", path.display()))
                    .with_suggestion("check that the game directory is writable")
            })?;
        }
        Ok(())
    }

    fn init_packs(&mut self) -> Result<(), LauncherError> {
        let pack_dir = self.base_path.join(&self.config.packs.directory);
        let index_path = pack_dir.join(&self.config.packs.index_file);
        let index = PacksIndex::load(&index_path).map_err(|e| {
            LauncherError::new(INIT_PACKS, "the pack index could not be read")
                .with_details(e.to_string())
                .with_suggestion(format!(
                    "make sure {} exists next to the game's packs",
                    index_path.display()
                ))
        })?;

        let aes_key = match crypto::load_aes_key_from_env() {
            Ok(key) => Some(key),
            Err(CryptoError::KeyMissing) if !self.config.packs.encrypted => None,
            Err(err) => {
                return Err(LauncherError::new(
                    INIT_PACKS,
                    "the pack encryption key is missing or invalid",
                )
                .with_details(err.to_string())
                .with_suggestion(format!(
                    "set {} or {}",
                    crypto::ENV_AES_KEY_HEX,
                    crypto::ENV_AES_KEY_FILE
                )));
            }
        };
        let public_key_pem = match std::env::var(ENV_PUBLIC_KEY) {
            Ok(path) => Some(std::fs::read_to_string(&path).map_err(|e| {
                LauncherError::new(INIT_PACKS, "the pack signing public key could not be read")
                    .with_details(format!("{path}: {e}"))
                    .with_suggestion(format!("fix the path in {ENV_PUBLIC_KEY}"))
            })?),
            Err(_) => None,
        };
        self.vfs = MultiPackVfs::with_keys(aes_key, public_key_pem.as_deref()).map_err(|e| {
            LauncherError::new(INIT_PACKS, "the pack signing public key is invalid")
                .with_details(e.to_string())
        })?;

        let mut loaded = 0usize;
        for entry in &index.packs {
            let Some(pack_type) = PackType::parse(&entry.pack_type) else {
                warn!(target: "runtime", pack = %entry.path, declared = %entry.pack_type,
                    "unknown pack type; skipping");
                continue;
            };
            let path = pack_dir.join(&entry.path);
            // A bad pack only loses its own layer; the rest of the game
            // stays playable.
            match self.vfs.load_pack(&path, pack_type, entry.priority) {
                Ok(()) => loaded += 1,
                Err(err) => {
                    warn!(target: "runtime", pack = %path.display(), %err, "pack failed to load");
                }
            }
        }
        if loaded == 0 && !index.packs.is_empty() {
            return Err(
                LauncherError::new(INIT_PACKS, "no resource packs could be loaded")
                    .with_details(format!("{} pack(s) listed, 0 loaded", index.packs.len()))
                    .with_suggestion("verify the pack files are present and undamaged"),
            );
        }
        info!(target: "runtime", loaded, listed = index.packs.len(), "packs ready");
        Ok(())
    }

    fn init_input(&self) -> Result<(), LauncherError> {
        if self.config.input.bindings.is_empty() {
            return Err(
                LauncherError::new(INIT_INPUT, "no input bindings are configured")
                    .with_suggestion("remove the input section from runtime_user.json"),
            );
        }
        info!(target: "runtime", actions = self.config.input.bindings.len(), "input bindings ready");
        Ok(())
    }

    fn init_save(&self) -> Result<(), LauncherError> {
        if self.config.saves.max_slots < 1 {
            return Err(
                LauncherError::new(INIT_SAVE, "save system is configured with zero slots")
                    .with_details(format!("maxSlots = {}", self.config.saves.max_slots))
                    .with_suggestion("set saves.maxSlots to at least 1"),
            );
        }
        Ok(())
    }

    fn init_locale(&mut self) -> Result<(), LauncherError> {
        let loc = &self.config.localization;
        if !loc.available_locales.contains(&loc.current_locale) {
            return Err(LauncherError::new(INIT_LOCALE, "the selected locale is not available")
                .with_details(format!(
                    "selected '{}', available: {}",
                    loc.current_locale,
                    loc.available_locales.join(", ")
                ))
                .with_suggestion("pass --lang with one of the available locales"));
        }
        self.l10n = Some(LocalizationManager::load(
            &self.vfs,
            &loc.available_locales,
            &loc.current_locale,
            &loc.default_locale,
        ));
        Ok(())
    }

    fn init_script(&mut self) -> Result<(), LauncherError> {
        let blob = self.vfs.read_all(COMPILED_SCRIPTS_PATH).map_err(|e| {
            LauncherError::new(INIT_SCRIPT, "the compiled script could not be read")
                .with_details(e.to_string())
                .with_suggestion("rebuild the game's base pack")
        })?;
        let script = CompiledScript::decode(&blob).map_err(|e| {
            LauncherError::new(INIT_SCRIPT, "the compiled script is damaged")
                .with_details(e.to_string())
                .with_suggestion("rebuild the game's base pack")
        })?;
        self.characters = script.characters.clone();
        let scenes: Vec<String> = script.scene_entry_points.keys().cloned().collect();

        self.runtime.load(script).map_err(|e| {
            LauncherError::new(INIT_SCRIPT, "the compiled script could not be loaded")
                .with_details(e.to_string())
        })?;

        if self.config.debug.enable_debug_console {
            let mut debugger = VmDebugger::new();
            debugger.set_logpoint_callback(|message, ip| {
                info!(target: "vm.debugger", ip, message, "logpoint");
            });
            self.runtime.vm_mut().attach_debugger(debugger);
            info!(target: "runtime", "debug mode: VM debugger attached");
        }

        let start_scene = self
            .args
            .scene
            .clone()
            .unwrap_or_else(|| self.config.game.start_scene.clone());
        self.runtime.goto_scene(&start_scene).map_err(|e| {
            LauncherError::new(INIT_SCRIPT, "the start scene does not exist")
                .with_details(e.to_string())
                .with_suggestion(format!("available scenes: {}", scenes.join(", ")))
        })?;
        info!(target: "runtime", scene = %start_scene, "script ready");
        Ok(())
    }

    /// Terminal main loop: fixed-ish timestep, events rendered as text,
    /// input read from stdin.
    fn run(&mut self) -> i32 {
        println!(
            "{} v{} — NovelMind runtime",
            self.config.game.name, self.config.game.version
        );
        let tick = Duration::from_millis(16);
        let mut last = Instant::now();
        loop {
            let now = Instant::now();
            let dt = (now - last).as_secs_f32();
            last = now;

            self.runtime.update(dt);
            for event in self.runtime.drain_events() {
                self.present(&event);
            }

            match self.runtime.state() {
                RuntimeState::WaitingInput => {
                    self.prompt_continue();
                    self.runtime.signal_continue();
                }
                RuntimeState::WaitingChoice => {
                    let index = self.prompt_choice();
                    if let Err(err) = self.runtime.choose(index) {
                        warn!(target: "runtime", %err, "choice rejected");
                    }
                }
                RuntimeState::WaitingTimer => std::thread::sleep(tick),
                RuntimeState::Halted => {
                    info!(target: "runtime", "script finished");
                    println!("\n— end —");
                    return 0;
                }
                RuntimeState::Running => {}
                RuntimeState::Idle | RuntimeState::Ready => {
                    let err = LauncherError::new(RUNTIME, "the script runtime left the main loop")
                        .with_details(format!("state: {:?}", self.runtime.state()));
                    eprintln!("{err}");
                    error!(target: "runtime", code = err.code, "unexpected runtime state");
                    return 1;
                }
            }
        }
    }

    fn present(&self, event: &ScriptEvent) {
        match event.kind {
            ScriptEventKind::SceneChange => {
                println!("\n· {} ·", event.name);
            }
            ScriptEventKind::DialogueStart => {
                let speaker = self.display_name(&event.name);
                let text = event.value.as_string();
                if speaker.is_empty() {
                    println!("{text}");
                } else {
                    println!("{speaker}: {text}");
                }
            }
            ScriptEventKind::ChoiceStart => {
                for (i, option) in self.runtime.current_choices().iter().enumerate() {
                    println!("  {}) {option}", i + 1);
                }
            }
            ScriptEventKind::ChoiceSelected => {
                info!(target: "runtime", choice = %event.name, "choice selected");
            }
            ScriptEventKind::Transition => {
                info!(target: "runtime", kind = %event.name,
                    duration = event.value.as_float(), "transition");
            }
            ScriptEventKind::PlaybackRequest => {
                info!(target: "runtime", resource = %event.name,
                    medium = %event.value.as_string(), "playback request");
            }
            ScriptEventKind::Stop => {
                info!(target: "runtime", fadeout = event.value.as_float(), "stop music");
            }
        }
    }

    fn display_name(&self, speaker_id: &str) -> String {
        match self.characters.get(speaker_id) {
            Some(decl) if !decl.display_name.is_empty() => decl.display_name.clone(),
            _ => speaker_id.to_string(),
        }
    }

    fn prompt_continue(&self) {
        print!("  [enter] ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    }

    fn prompt_choice(&self) -> i32 {
        let count = self.runtime.current_choices().len();
        loop {
            print!("choose 1-{count}: ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return 0;
            }
            if let Ok(n) = line.trim().parse::<i32>() {
                if n >= 1 && n <= count as i32 {
                    return n - 1;
                }
            }
            println!("please enter a number between 1 and {count}");
        }
    }
}
