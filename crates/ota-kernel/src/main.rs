use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use ed25519_dalek::SigningKey;
use ota_kernel::audit::{AuditLog, JsonlAuditStore};
use ota_kernel::collaborators::{
    Collaborators, DigestVerifier, DirectorySource, Ed25519Verifier, PackageVerifier, PassthroughToolchain,
    ToolchainRegistry,
};
use ota_kernel::error::AuditError;
use ota_kernel::{ErrorClass, InjectionManager, JobId, JobView, ManagerError, OtaConfig};
use ota_registry::{report, InjectionRequest, RegistryStore, ServiceRegistry};
use rand::rngs::OsRng;
use semver::Version;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_VALIDATION: i32 = 2;
const EXIT_BUILD_TEST: i32 = 3;
const EXIT_INFRASTRUCTURE: i32 = 4;

fn cli() -> Command {
    Command::new("ota-kernel")
        .version(ota_kernel::VERSION)
        .about("Over-the-air service injection manager")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to the TOML configuration file"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("submit")
                .about("Inject a service and wait for the outcome")
                .arg(
                    Arg::new("descriptor")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON injection request"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show a job's state")
                .arg(Arg::new("job-id").required(true).help("Job ID returned by submit")),
        )
        .subcommand(
            Command::new("list").about("List Active services").arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Output as JSON"),
            ),
        )
        .subcommand(
            Command::new("audit")
                .about("Inspect the audit trail")
                .subcommand_required(true)
                .subcommand(Command::new("export").about("Print every record as JSON"))
                .subcommand(Command::new("verify").about("Check the hash chain"))
                .subcommand(
                    Command::new("report").about("Summarize recent operations").arg(
                        Arg::new("limit")
                            .long("limit")
                            .default_value("10")
                            .value_parser(value_parser!(usize))
                            .help("Number of operations to show"),
                    ),
                ),
        )
        .subcommand(
            Command::new("revert")
                .about("Re-inject the previous version of a service")
                .arg(Arg::new("name").required(true).help("Service name")),
        )
        .subcommand(Command::new("graph").about("Print the Active dependency graph and activation order"))
        .subcommand(Command::new("keygen").about("Generate an ed25519 signing key pair"))
        .subcommand(
            Command::new("sign")
                .about("Write a detached signature next to a package")
                .arg(
                    Arg::new("package")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Package file named <name>-<version>.pkg"),
                )
                .arg(
                    Arg::new("key")
                        .long("key")
                        .required(true)
                        .help("Hex-encoded ed25519 secret key"),
                ),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let code = match run(&matches).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            EXIT_USAGE
        }
    };
    std::process::exit(code);
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("OTA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<i32> {
    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => OtaConfig::load(path)?,
        None => OtaConfig::default(),
    };

    match matches.subcommand() {
        Some(("submit", args)) => {
            let path = args.get_one::<PathBuf>("descriptor").context("descriptor path required")?;
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let request: InjectionRequest =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

            let manager = open_manager(&config)?;
            let job_id = match manager.submit(request) {
                Ok(id) => id,
                Err(err @ ManagerError::InvalidDescriptor(_)) => {
                    eprintln!("rejected: {err}");
                    return Ok(EXIT_VALIDATION);
                }
                Err(err) => return Err(err.into()),
            };
            finish(&manager, job_id).await
        }
        Some(("status", args)) => {
            let raw = args.get_one::<String>("job-id").context("job id required")?;
            let job_id: JobId = raw.parse().with_context(|| format!("invalid job id {raw:?}"))?;
            let manager = open_manager(&config)?;
            let view = manager.status(job_id)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(EXIT_OK)
        }
        Some(("list", args)) => {
            let registry = ServiceRegistry::open(RegistryStore::in_dir(&config.state_dir))?;
            if args.get_flag("json") {
                let entries: Vec<_> = registry.list().iter().map(|e| e.summary()).collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print!("{}", report::render(&registry.snapshot(), config.manager.compatibility));
            }
            Ok(EXIT_OK)
        }
        Some(("audit", args)) => audit_command(&config.state_dir, args),
        Some(("revert", args)) => {
            let name = args.get_one::<String>("name").context("service name required")?;
            let manager = open_manager(&config)?;
            let job_id = match manager.revert(name) {
                Ok(id) => id,
                Err(err @ ManagerError::NoPreviousVersion(_)) => {
                    eprintln!("{err}");
                    return Ok(EXIT_VALIDATION);
                }
                Err(err) => return Err(err.into()),
            };
            finish(&manager, job_id).await
        }
        Some(("graph", _)) => {
            let registry = ServiceRegistry::open(RegistryStore::in_dir(&config.state_dir))?;
            let out = serde_json::json!({
                "registryVersion": registry.version(),
                "dependencies": registry.dependency_graph(),
                "activationOrder": registry.activation_order()?,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(EXIT_OK)
        }
        Some(("keygen", _)) => {
            let key = SigningKey::generate(&mut OsRng);
            let out = serde_json::json!({
                "secretKey": hex::encode(key.to_bytes()),
                "publicKey": hex::encode(key.verifying_key().as_bytes()),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(EXIT_OK)
        }
        Some(("sign", args)) => {
            let package = args.get_one::<PathBuf>("package").context("package path required")?;
            let key = args.get_one::<String>("key").context("key required")?;
            sign_package(package, key)?;
            Ok(EXIT_OK)
        }
        _ => bail!("unknown command; see --help"),
    }
}

fn open_manager(config: &OtaConfig) -> anyhow::Result<InjectionManager> {
    let verifier: Arc<dyn PackageVerifier> = match &config.verifier.trusted_key {
        Some(key) => Arc::new(Ed25519Verifier::from_hex(key).map_err(anyhow::Error::msg)?),
        None => Arc::new(DigestVerifier),
    };

    let configured = config.toolchains_by_language();
    let toolchains = if configured.is_empty() {
        tracing::warn!("no toolchains configured; generate, build and test are skipped");
        ToolchainRegistry::uniform(Arc::new(PassthroughToolchain))
    } else {
        configured
            .into_iter()
            .fold(ToolchainRegistry::new(), |registry, (language, toolchain)| {
                registry.with(language, Arc::new(toolchain))
            })
    };

    let collaborators = Collaborators::new(
        Arc::new(DirectorySource::new(&config.source.root)),
        verifier,
        toolchains,
    );
    Ok(InjectionManager::open(config.manager.clone(), collaborators, &config.state_dir)?)
}

async fn finish(manager: &InjectionManager, job_id: JobId) -> anyhow::Result<i32> {
    let view = manager.wait(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(exit_code(&view))
}

fn exit_code(view: &JobView) -> i32 {
    if view.succeeded() {
        return EXIT_OK;
    }
    match view.detail.as_ref().map(|d| d.kind.class()) {
        Some(ErrorClass::Validation) => EXIT_VALIDATION,
        Some(ErrorClass::BuildTest) => EXIT_BUILD_TEST,
        Some(ErrorClass::Infrastructure) | None => EXIT_INFRASTRUCTURE,
    }
}

fn audit_command(state_dir: &Path, args: &ArgMatches) -> anyhow::Result<i32> {
    let log = match AuditLog::open(Box::new(JsonlAuditStore::in_dir(state_dir))) {
        Ok(log) => log,
        Err(err @ (AuditError::IntegrityViolation { .. } | AuditError::Corrupt { .. })) => {
            eprintln!("{err}");
            return Ok(EXIT_INFRASTRUCTURE);
        }
        Err(err) => return Err(err.into()),
    };

    match args.subcommand() {
        Some(("export", _)) => println!("{}", serde_json::to_string_pretty(&log.export())?),
        Some(("verify", _)) => {
            log.verify_integrity()?;
            println!("audit chain intact ({} records)", log.len());
        }
        Some(("report", sub)) => {
            let limit = sub.get_one::<usize>("limit").copied().unwrap_or(10);
            print!("{}", log.report(limit));
        }
        _ => bail!("unknown audit command; see --help"),
    }
    Ok(EXIT_OK)
}

fn sign_package(package: &Path, key_hex: &str) -> anyhow::Result<()> {
    let stem = package
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(".pkg"))
        .with_context(|| format!("{} is not a .pkg file", package.display()))?;
    let (name, version) = split_package_stem(stem)
        .with_context(|| format!("cannot read <name>-<version> from {stem:?}"))?;

    let mut secret = [0u8; 32];
    hex::decode_to_slice(key_hex.trim(), &mut secret).context("secret key must be 64 hex characters")?;
    let key = SigningKey::from_bytes(&secret);

    let payload = std::fs::read(package).with_context(|| format!("reading {}", package.display()))?;
    let signature = Ed25519Verifier::sign(&key, name, &version, &payload);

    let mut sig_path = package.as_os_str().to_owned();
    sig_path.push(".sig");
    std::fs::write(&sig_path, hex::encode(signature.to_bytes()))
        .with_context(|| format!("writing {}", Path::new(&sig_path).display()))?;
    println!("{}", Path::new(&sig_path).display());
    Ok(())
}

/// Split at the first `-` whose remainder is a valid version
fn split_package_stem(stem: &str) -> Option<(&str, Version)> {
    stem.match_indices('-').find_map(|(idx, _)| {
        let (name, rest) = (&stem[..idx], &stem[idx + 1..]);
        Version::parse(rest).ok().filter(|_| !name.is_empty()).map(|v| (name, v))
    })
}
