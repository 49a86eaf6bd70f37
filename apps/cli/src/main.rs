use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use plankton_core_sdk::{
    db::SettingsStore,
    document::MemoryDocument,
    models::{Alignment, Formatting, Status, StatusKind},
    server,
    session::{Action, Session},
    telemetry::{FileLogger, Logger},
};

/**
 * \brief CLI 程序入口：以文本文件充当宿主文档。
 */
#[derive(Parser, Debug)]
#[command(name = "plankton", version, about = "Plankton AI writing assistant")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /** \brief 查看或修改持久化设置。 */
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /** \brief 拉取模型目录并按关键字过滤显示。 */
    Models {
        #[arg(long, default_value = "")]
        filter: String,
    },

    /** \brief 润色选区。 */
    Improve(DocArgs),

    /** \brief 修正选区语法。 */
    FixGrammar(DocArgs),

    /** \brief 以选区为上下文生成想法，插入到选区之后。 */
    Ideas(DocArgs),

    /** \brief 按自定义指令改写选区。 */
    Rewrite {
        #[command(flatten)]
        doc: DocArgs,
        #[arg(long)]
        instruction: String,
    },

    /** \brief 设置全文字体、字号、行距与对齐。 */
    Format {
        #[command(flatten)]
        doc: DocArgs,
        #[arg(long, default_value = "Calibri")]
        font: String,
        #[arg(long, default_value_t = 11.0)]
        size: f32,
        #[arg(long, default_value_t = 14.0)]
        spacing: f32,
        #[arg(long, default_value = "left")]
        align: Alignment,
    },

    /** \brief 在光标（--end）处请求一次续写。 */
    Complete(DocArgs),

    /** \brief 启动本地 HTTP 服务（任务窗格后端）。 */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5174")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show,
    SetKey {
        #[arg(long)]
        key: String,
    },
    Model {
        #[arg(long)]
        id: String,
    },
    Autocomplete {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    Telemetry {
        #[arg(long)]
        enabled: bool,
    },
}

#[derive(Args, Debug)]
struct DocArgs {
    /** \brief 文档文件路径 */
    #[arg(long)]
    file: PathBuf,
    /** \brief 选区起点（字符下标），默认等于终点 */
    #[arg(long)]
    start: Option<usize>,
    /** \brief 选区终点（字符下标），默认文末 */
    #[arg(long)]
    end: Option<usize>,
    /** \brief 将结果写回文件，否则输出到 stdout */
    #[arg(long, default_value_t = false)]
    write: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = SettingsStore::open_default().context("open settings store failed")?;
    let telemetry_enabled = store.telemetry_enabled().unwrap_or(false);
    let logger = Arc::new(FileLogger::new("logs", telemetry_enabled));

    match cli.command {
        Commands::Config { command } => run_config(store, logger, command)?,
        Commands::Models { filter } => {
            let (session, _) = open_session(store, logger, MemoryDocument::default())?;
            report(&session.refresh_models().await)?;
            for m in session.filter_models(&filter) {
                match m.description.as_deref() {
                    Some(desc) => println!("{}\t{}\t{}", m.id, m.name, first_line(desc)),
                    None => println!("{}\t{}", m.id, m.name),
                }
            }
        }
        Commands::Improve(doc) => run_action(store, logger, doc, Action::Improve).await?,
        Commands::FixGrammar(doc) => run_action(store, logger, doc, Action::FixGrammar).await?,
        Commands::Ideas(doc) => run_action(store, logger, doc, Action::GenerateIdeas).await?,
        Commands::Rewrite { doc, instruction } => {
            run_action(store, logger, doc, Action::Rewrite { instruction }).await?
        }
        Commands::Format {
            doc,
            font,
            size,
            spacing,
            align,
        } => {
            let formatting = Formatting {
                font_name: font,
                font_size: size,
                line_spacing: spacing,
                alignment: align,
            };
            // 纯文本文件无法承载格式，仅报告结果
            let (session, document, _) = load_document(store, logger, doc)?;
            report(&session.run(Action::Format(formatting)).await)?;
            let format = document.format();
            println!(
                "font={} size={} paragraphs={}",
                format.font_name.unwrap_or_default(),
                format.font_size.unwrap_or_default(),
                format.paragraphs.len()
            );
        }
        Commands::Complete(doc) => {
            let (session, document, doc) = load_document(store, logger, doc)?;
            report(&session.suggest_once().await)?;
            emit(&document, &doc)?;
        }
        Commands::Serve { addr } => {
            let state = server::AppState::bootstrap(store).context("bootstrap server failed")?;
            server::run(&addr, state).await?;
        }
    }

    Ok(())
}

fn run_config(store: SettingsStore, logger: Arc<FileLogger>, command: ConfigCommand) -> Result<()> {
    if let ConfigCommand::Telemetry { enabled } = command {
        store
            .save_telemetry_enabled(enabled)
            .context("save telemetry failed")?;
        println!("telemetry_enabled={}", enabled);
        return Ok(());
    }

    let (session, _) = open_session(store, logger, MemoryDocument::default())?;
    match command {
        ConfigCommand::Show => {
            let s = session.settings();
            println!(
                "api_key={}",
                if s.api_key.is_some() { "set" } else { "unset" }
            );
            println!("model={}", s.model_or_default());
            println!("autocomplete_enabled={}", s.autocomplete_enabled);
            println!("autocomplete_delay_ms={}", s.autocomplete_delay_ms);
            println!(
                "telemetry_enabled={}",
                session.settings_store().telemetry_enabled().unwrap_or(false)
            );
        }
        ConfigCommand::SetKey { key } => report(&session.set_api_key(&key))?,
        ConfigCommand::Model { id } => report(&session.select_model(&id))?,
        ConfigCommand::Autocomplete { enabled, delay_ms } => {
            if let Some(ms) = delay_ms {
                report(&session.set_autocomplete_delay(ms))?;
            }
            if let Some(on) = enabled {
                report(&session.set_autocomplete(on))?;
            }
        }
        ConfigCommand::Telemetry { .. } => {}
    }
    Ok(())
}

fn open_session(
    store: SettingsStore,
    logger: Arc<FileLogger>,
    document: MemoryDocument,
) -> Result<(Session, Arc<MemoryDocument>)> {
    let document = Arc::new(document);
    let session = Session::with_openrouter(store, document.clone(), logger);
    session.restore().context("restore settings failed")?;
    Ok((session, document))
}

fn load_document(
    store: SettingsStore,
    logger: Arc<FileLogger>,
    args: DocArgs,
) -> Result<(Session, Arc<MemoryDocument>, DocArgs)> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("read {} failed", args.file.display()))?;
    let len = text.chars().count();
    let end = args.end.unwrap_or(len);
    let start = args.start.unwrap_or(end);
    let document = MemoryDocument::new(text);
    document
        .set_selection(start, end)
        .context("invalid selection")?;
    let (session, document) = open_session(store, logger, document)?;
    Ok((session, document, args))
}

async fn run_action(
    store: SettingsStore,
    logger: Arc<FileLogger>,
    args: DocArgs,
    action: Action,
) -> Result<()> {
    let (session, document, args) = load_document(store, logger.clone(), args)?;
    let status = session.run(action).await;
    report(&status)?;
    emit(&document, &args)?;
    logger.info(&format!("cli action finished for {}", args.file.display()));
    Ok(())
}

fn emit(document: &MemoryDocument, args: &DocArgs) -> Result<()> {
    if args.write {
        std::fs::write(&args.file, document.text())
            .with_context(|| format!("write {} failed", args.file.display()))?;
        println!("Saved {}", args.file.display());
    } else {
        println!("{}", document.text());
    }
    Ok(())
}

fn report(status: &Status) -> Result<()> {
    match status.kind {
        StatusKind::Error => bail!("{}", status.message),
        _ => {
            eprintln!("{}", status.message);
            Ok(())
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
