use std::{fs::File, io::BufWriter, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use itertools::Itertools;
use optkit::{
    EncodingFile, Equalizer, QuantSimConfig, QuantizationSimModel,
    cle::{self, find_layer_groups_to_scale},
    graph::{ConnectedGraph, GraphBounds},
    model::Model,
    tensor::{Shape, Tensor},
};
use rand::{SeedableRng, rngs::StdRng};
use serde_json::json;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Emit logs as JSON lines.
    #[arg(long, env = "OPTKIT_JSON_LOGS")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs)]
struct ModelArgs {
    /// Path to the model, an ONNX file or a saved snapshot.
    #[arg(short, long, env = "OPTKIT_MODEL")]
    model: PathBuf,

    /// Shape of a model input, e.g. `1,3,224,224`. Repeat once per input.
    #[arg(short = 's', long = "input-shape", value_parser = parse_shape, required = true)]
    input_shapes: Vec<Shape>,
}

#[derive(Subcommand)]
enum Command {
    /// Describe the connected graph of a model and its cross-layer scaling groups.
    Graph {
        #[command(flatten)]
        model: ModelArgs,

        /// Where to write the JSON description, stdout if absent.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fold batchnorms into their neighbouring convolution or linear layers.
    Fold {
        #[command(flatten)]
        model: ModelArgs,

        /// Where to save the folded model snapshot.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run the whole cross-layer equalization pipeline.
    Equalize {
        #[command(flatten)]
        model: ModelArgs,

        /// Module names the equalized region starts from.
        #[arg(long, value_delimiter = ',')]
        start_ops: Vec<String>,

        /// Module names the equalized region ends at.
        #[arg(long, value_delimiter = ',')]
        output_ops: Vec<String>,

        /// Where to save the equalized model snapshot.
        #[arg(short, long)]
        output: PathBuf,

        /// Where to write the JSON equalization report.
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Calibrate a quantization simulation and export its encodings.
    Quantize {
        #[command(flatten)]
        model: ModelArgs,

        /// JSON quantization settings, defaults apply when absent.
        #[arg(short, long, env = "OPTKIT_QUANT_CONFIG")]
        config: Option<PathBuf>,

        /// Number of random calibration batches.
        #[arg(long, default_value = "8")]
        batches: usize,

        /// Seed of the random calibration data.
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Encodings to freeze before calibrating the remaining quantizers.
        #[arg(long)]
        freeze: Option<PathBuf>,

        /// Where to write the JSON encodings.
        #[arg(short, long)]
        encodings: PathBuf,
    },
}

fn parse_shape(s: &str) -> Result<Shape> {
    let shape = s
        .split(',')
        .map(|d| {
            d.trim()
                .parse::<usize>()
                .with_context(|| format!("invalid dimension '{d}' in shape '{s}'"))
        })
        .collect::<Result<Shape>>()?;
    if shape.is_empty() || shape.contains(&0) {
        bail!("shape '{s}' must have positive dimensions");
    }
    Ok(shape)
}

impl ModelArgs {
    fn load(&self) -> Result<Model> {
        let is_onnx = self
            .model
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
        let model = if is_onnx {
            optkit::load_model(&self.model)
        } else {
            Model::load(&self.model)
        }
        .with_context(|| format!("loading model from {}", self.model.display()))?;
        info!(
            "loaded '{}' with {} module(s) and {} input(s)",
            model.name(),
            model.num_modules(),
            model.num_inputs()
        );
        if model.num_inputs() != self.input_shapes.len() {
            bail!(
                "model has {} input(s) but {} shape(s) were given",
                model.num_inputs(),
                self.input_shapes.len()
            );
        }
        Ok(model)
    }
}

fn write_json(value: &serde_json::Value, path: Option<&PathBuf>) -> Result<()> {
    match path {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), value)
                .with_context(|| format!("writing {}", path.display()))?;
            info!("wrote {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn describe_graph(model: &Model, input_shapes: &[Shape]) -> Result<serde_json::Value> {
    let graph = ConnectedGraph::build(model, input_shapes)?;
    let ops = graph
        .ordered_ops()
        .map(|op| {
            json!({
                "name": op.name(),
                "type": op.kind().type_tag(),
                "dotted_name": op.dotted_name(),
                "output_shape": op.output_shape(),
                "consumers": graph
                    .consumers(op)
                    .iter()
                    .map(|c| graph.op(*c).name())
                    .collect_vec(),
            })
        })
        .collect_vec();
    let groups = find_layer_groups_to_scale(&graph)
        .into_iter()
        .map(|group| group.into_iter().map(|id| graph.op(id).dotted_name()).collect_vec())
        .collect_vec();
    info!(
        "graph of '{}': {} operation(s), {} split(s), {} layer group(s)",
        graph.model_name(),
        ops.len(),
        graph.split_count(),
        groups.len()
    );
    Ok(json!({
        "model": graph.model_name(),
        "operations": ops,
        "layer_groups": groups,
    }))
}

fn calibrate(
    sim: &mut QuantizationSimModel,
    input_shapes: &[Shape],
    batches: usize,
    seed: u64,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..batches)
        .map(|_| {
            input_shapes
                .iter()
                .map(|shape| Tensor::random_with(shape.clone(), &mut rng))
                .collect_vec()
        })
        .collect_vec();
    sim.compute_encodings(|sim| {
        for batch in &data {
            sim.forward(batch)?;
        }
        Ok(())
    })
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Graph { model, output } => {
            let description = describe_graph(&model.load()?, &model.input_shapes)?;
            write_json(&description, output.as_ref())
        }
        Command::Fold { model, output } => {
            let folded = cle::fold_all_batch_norms(
                &model.load()?,
                &model.input_shapes,
                &GraphBounds::default(),
            )?;
            info!("folded {} batchnorm(s)", folded.result.len());
            folded.model.save(&output)?;
            info!("saved folded model to {}", output.display());
            Ok(())
        }
        Command::Equalize {
            model,
            start_ops,
            output_ops,
            output,
            report,
        } => {
            let mut equalizer = Equalizer::new(model.input_shapes.clone());
            if !start_ops.is_empty() {
                equalizer = equalizer.with_start_ops(start_ops);
            }
            if !output_ops.is_empty() {
                equalizer = equalizer.with_output_ops(output_ops);
            }
            let (equalized, cle_report) = equalizer.equalize(&model.load()?)?;
            equalized.save(&output)?;
            info!("saved equalized model to {}", output.display());
            if let Some(report) = report {
                write_json(&serde_json::to_value(&cle_report)?, Some(&report))?;
            }
            Ok(())
        }
        Command::Quantize {
            model,
            config,
            batches,
            seed,
            freeze,
            encodings,
        } => {
            let config = match config {
                Some(path) => QuantSimConfig::from_file(path)?,
                None => QuantSimConfig::default().validate()?,
            };
            let mut sim = QuantizationSimModel::new(model.load()?, config)?;
            if let Some(path) = freeze {
                let frozen = sim.load_and_freeze_encodings(&EncodingFile::load(path)?)?;
                info!("froze {frozen} encoding(s)");
            }
            calibrate(&mut sim, &model.input_shapes, batches, seed)?;
            sim.export(&encodings)?;
            info!("exported encodings to {}", encodings.display());
            Ok(())
        }
    }
}

fn setup_logging(json: bool) -> Result<()> {
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    };
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(filter())
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("Setting up logging failed")
    } else {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .compact()
            .with_level(true)
            .with_file(false)
            .with_line_number(false)
            .with_target(false)
            .with_env_filter(filter())
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("Setting up logging failed")
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.json)?;
    run(args.command)
}
