use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use qc_common::{
    Executor, PipelineConfig, PipelineDefinition, RunInfo, RunOptions, RunRequest, RunResults,
    RunSummary, Scheduler, StepRegistry, WorkerMetrics,
};
use reqwest::Client;
use std::{
    env,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::inputs;

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "histoqc")]
#[command(about = "Control de calidad de láminas: corre el pipeline local o contra el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct InputArgs {
    /// Archivos, un patrón glob o una lista .tsv
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<String>,

    /// Directorio de salida (por defecto histoqc_output_<fecha>)
    #[arg(short = 'o', long)]
    outdir: Option<PathBuf>,

    /// Prefijo de las rutas de entrada
    #[arg(short = 'p', long, default_value = "")]
    basepath: PathBuf,

    /// Archivo JSON de configuración o nombre de un template
    #[arg(short = 'c', long, default_value = "default")]
    config: String,

    /// Reprocesa archivos ya completados
    #[arg(short = 'f', long)]
    force: bool,

    /// Filas por tabla de resultados
    #[arg(short = 'b', long)]
    batch: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Corre el pipeline en esta máquina
    Run {
        #[command(flatten)]
        input: InputArgs,

        /// Cantidad de workers locales
        #[arg(short = 'n', long, default_value_t = 1)]
        nprocesses: usize,
    },
    /// Envía una corrida al master
    Submit {
        #[command(flatten)]
        input: InputArgs,

        #[arg(long, default_value = "histoqc")]
        name: String,
    },
    /// Consulta el estado de una corrida
    Status {
        #[arg(value_name = "RUN_ID")]
        id: String,
    },
    /// Tablas y fallas de una corrida
    Results {
        #[arg(value_name = "RUN_ID")]
        id: String,
    },
    /// Lista los workers registrados
    Workers,
}

fn default_outdir() -> PathBuf {
    PathBuf::from(format!("histoqc_output_{}", Local::now().format("%Y%m%d-%H%M%S")))
}

/// `-c` acepta una ruta a un JSON o el nombre de un template incluido.
fn load_config(config: &str) -> Result<PipelineConfig> {
    let path = Path::new(config);
    if path.exists() {
        PipelineConfig::from_file(path)
    } else {
        PipelineConfig::template(config)
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Corrida {}:", summary.run_id);
    println!(
        "  archivos: total={}, ok={}, con falla={}, salteados={}",
        summary.total, summary.succeeded, summary.failed, summary.skipped
    );
    for table in &summary.tables {
        println!("  tabla: {}", table.display());
    }
    println!("  fallas: {}", summary.failure_table.display());
    println!("  ledger: {}", summary.ledger_path.display());

    if !summary.failures.is_empty() {
        println!("Archivos con falla:");
        for f in &summary.failures {
            println!("  {}\t{}\t{}\t{}", f.file_id, f.step, f.kind, f.message);
        }
    }
    if !summary.unrecorded.is_empty() {
        println!("Sin registrar en el ledger (se reprocesan la próxima vez):");
        for file in &summary.unrecorded {
            println!("  {}", file);
        }
    }
}

async fn run_local(input: InputArgs, nprocesses: usize) -> Result<()> {
    let config = load_config(&input.config)?;
    let pipeline = PipelineDefinition::build(&config, &StepRegistry::with_builtin_steps())?;
    info!("{}", pipeline);

    let files = inputs::resolve(&input.inputs, &input.basepath)?;
    if files.is_empty() {
        warn!("no se encontraron archivos para procesar");
        return Ok(());
    }

    let outdir = input.outdir.unwrap_or_else(default_outdir);
    let options = RunOptions::new(outdir)
        .with_base_path(input.basepath)
        .with_force(input.force)
        .with_batch_size(input.batch);

    let summary = Scheduler::local(Executor::new(pipeline), nprocesses.max(1), options)
        .run(files)
        .await?;
    print_summary(&summary);
    Ok(())
}

fn print_run(run: &RunInfo) {
    println!("Corrida:");
    println!("  id: {}", run.id);
    println!("  nombre: {}", run.name);
    println!("  estado: {:?}", run.status);
    println!(
        "  archivos: total={}, terminados={}, con falla={}, salteados={}",
        run.total_files, run.completed_files, run.failed_files, run.skipped_files
    );

    let done = run.completed_files + run.skipped_files;
    if run.total_files > 0 {
        let pct = (done as f64 / run.total_files as f64) * 100.0;
        println!("  progreso: {:.1}%", pct);
    }

    println!("  output_dir: {}", run.output_dir.display());
    println!("  submitted_at: {}", run.submitted_at);
    if let Some(ref started) = run.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = run.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(ref err) = run.error {
        println!("  error: {}", err);
    }
}

fn print_workers(workers: Vec<WorkerMetrics>) {
    if workers.is_empty() {
        println!("No hay workers registrados.");
        return;
    }
    for w in workers {
        println!("Worker {}", w.worker_id);
        println!("  host           : {}", w.hostname);
        println!("  dead           : {}", w.dead);
        println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
        println!("  concurrency    : max={}, activas={}", w.max_concurrency, w.active_tasks);
        println!(
            "  tareas         : started={}, ok={}, failed={}",
            w.tasks_started, w.tasks_succeeded, w.tasks_failed
        );
        match w.avg_task_ms {
            Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
            None => println!("  avg_task_ms    : (sin datos)"),
        }
        match w.cpu_percent {
            Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
            None => println!("  cpu_percent    : (sin datos)"),
        }
        match w.mem_bytes {
            Some(mem) => println!("  mem_bytes      : {}", mem),
            None => println!("  mem_bytes      : (sin datos)"),
        }
        println!();
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Run { input, nprocesses } => run_local(input, nprocesses).await?,

        Commands::Submit { input, name } => {
            let pipeline = load_config(&input.config)?;
            let files = inputs::resolve(&input.inputs, &input.basepath)?;
            let req = RunRequest {
                name,
                files,
                base_path: input.basepath,
                output_dir: input.outdir.unwrap_or_else(default_outdir),
                pipeline,
                force: input.force,
                batch_size: input.batch,
            };

            let url = format!("{}/api/v1/runs", base_url);
            let resp = client.post(&url).json(&req).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("master rechazó la corrida ({}): {}", status, body);
            }
            let run: RunInfo = resp.json().await.context("respuesta inválida del master")?;
            print_run(&run);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/runs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let run: RunInfo = resp.json().await?;
                print_run(&run);
            } else {
                println!("Error: corrida no encontrada (status {})", resp.status());
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/runs/{id}/results", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status().is_success() {
                let results: RunResults = resp.json().await?;
                println!("Resultados de la corrida {} ({:?}):", results.run_id, results.status);
                if results.tables.is_empty() {
                    println!("  (sin tablas todavía)");
                }
                for t in &results.tables {
                    println!("  tabla: {}", t.display());
                }
                if let Some(ref f) = results.failure_table {
                    println!("  fallas: {}", f.display());
                }
                for f in &results.failures {
                    println!("  {}\t{}\t{}\t{}", f.file_id, f.step, f.kind, f.message);
                }
            } else {
                println!("No se encontraron resultados para la corrida {id}");
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                print_workers(workers);
            } else {
                println!("Error consultando /api/v1/workers (status {})", resp.status());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definicion_de_la_cli_es_valida() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_acepta_las_opciones_cortas() {
        let cli = Cli::try_parse_from([
            "histoqc", "run", "-o", "out", "-p", "/data", "-c", "basic", "-f", "-b", "50", "-n",
            "4", "*.svs",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { input, nprocesses } => {
                assert_eq!(input.inputs, vec!["*.svs".to_string()]);
                assert_eq!(input.outdir, Some(PathBuf::from("out")));
                assert_eq!(input.basepath, PathBuf::from("/data"));
                assert!(input.force);
                assert_eq!(input.batch, Some(50));
                assert_eq!(nprocesses, 4);
            }
            _ => panic!("se esperaba el subcomando run"),
        }
    }

    #[test]
    fn config_por_template_o_archivo() {
        assert!(load_config("basic").is_ok());
        assert!(load_config("no-existe").is_err());

        let path = env::temp_dir().join(format!("histoqc_cli_cfg_{}.json", std::process::id()));
        std::fs::write(&path, r#"{"steps":[{"name":"BasicModule.getBasicStats"}]}"#).unwrap();
        let cfg = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.steps.len(), 1);
    }

    #[test]
    fn directorio_de_salida_por_defecto() {
        let name = default_outdir().to_string_lossy().to_string();
        assert!(name.starts_with("histoqc_output_"));
        assert_eq!(name.len(), "histoqc_output_".len() + "YYYYmmdd-HHMMSS".len());
    }
}
