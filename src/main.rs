use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use facenet_bridge::cache::{AlignmentCache, EmbeddingCache};
use facenet_bridge::face::FaceJson;
use facenet_bridge::image_utils::{load_image, save_image};
use facenet_bridge::serve::Server;
use facenet_bridge::{Config, Embedder, Face, Facenet, FacenetBridge, MtcnnBridge};
use image::{Rgba, RgbaImage};
use imageproc::drawing;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct CmdArgs {
    /// Config file to read from
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Keep alignments and embeddings in this directory
    #[arg(long, value_name = "DIR", global = true)]
    cache_dir: Option<PathBuf>,

    /// Upper bound on inference threads
    #[arg(short, long, global = true)]
    max_threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the faces found in an image
    Align {
        image: PathBuf,

        /// Write a copy of the image with boxes and landmarks drawn
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the embedding of every face in an image
    Embedding { image: PathBuf },
    /// Distance between the first faces of two images
    Distance { a: PathBuf, b: PathBuf },
    /// Answer JSON requests on stdin, one per line
    Serve,
}

#[derive(Serialize)]
struct EmbeddingLine<'a> {
    face: String,
    #[serde(rename = "boundingBox")]
    bounding_box: &'a facenet_bridge::shapes::Rect,
    embedding: Vec<f32>,
}

fn main() -> Result<()> {
    // stdout carries results, keep logs on stderr
    let filter = EnvFilter::from_default_env();
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args = CmdArgs::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let total_threads = num_cpus::get();
    config.inference.threads = args
        .max_threads
        .unwrap_or(config.inference.threads)
        .clamp(1, total_threads);
    debug!("{config:?}");

    let start = Instant::now();
    match args.command {
        Command::Align { image, output } => {
            let mut facenet = Facenet::new(&config);
            facenet.init_mtcnn()?;
            let faces = match &args.cache_dir {
                Some(dir) => AlignmentCache::new(facenet, dir)?.align_file(&image)?,
                None => facenet.align_file(&image)?,
            };

            let list: Vec<FaceJson> = faces.iter().map(Face::to_json).collect();
            println!("{}", serde_json::to_string_pretty(&list)?);

            if let Some(output) = output {
                let mut img = load_image(&image)?;
                draw_faces(&mut img, &faces);
                save_image(&img, &output)?;
                info!("Result at {output:?}");
            }
        }
        Command::Embedding { image } => {
            let faces = embed_faces(&config, args.cache_dir.as_deref(), &[&image])?;
            for face in faces.iter().flatten() {
                let line = EmbeddingLine {
                    face: face.to_string(),
                    bounding_box: &face.bounding_box,
                    embedding: face.embedding()?.to_vec(),
                };
                println!("{}", serde_json::to_string(&line)?);
            }
        }
        Command::Distance { a, b } => {
            let faces = embed_faces(&config, args.cache_dir.as_deref(), &[&a, &b])?;
            let mut firsts = Vec::with_capacity(2);
            for (path, list) in [&a, &b].iter().zip(faces.iter()) {
                match list.first() {
                    Some(face) => firsts.push(face.embedding()?),
                    None => bail!("no face found in {path:?}"),
                }
            }
            println!("{}", Facenet::distance(firsts[0], firsts[1]));
        }
        Command::Serve => {
            let mut server =
                Server::new(FacenetBridge::new(&config), MtcnnBridge::new(&config));
            let stdin = io::stdin();
            server.run(stdin.lock(), io::stdout().lock())?;
        }
    }
    debug!("Took {:?}", start.elapsed());

    Ok(())
}

/// Aligns every image and embeds all of its faces.
fn embed_faces(
    config: &Config,
    cache_dir: Option<&Path>,
    images: &[&PathBuf],
) -> Result<Vec<Vec<Face>>> {
    let mut facenet = Facenet::new(config);
    facenet.init()?;

    match cache_dir {
        Some(dir) => {
            let mut aligner = AlignmentCache::new(facenet, dir)?;
            let mut aligned = Vec::with_capacity(images.len());
            for image in images {
                aligned.push(aligner.align_file(image)?);
            }

            let facenet = aligner.into_inner();
            let mut cache = EmbeddingCache::new(facenet, dir)?;
            for face in aligned.iter_mut().flatten() {
                cache.embedding(face)?;
            }
            Ok(aligned)
        }
        None => {
            let mut all = Vec::with_capacity(images.len());
            for image in images {
                let mut faces = facenet
                    .align_file(image)
                    .with_context(|| format!("aligning {image:?}"))?;
                for face in faces.iter_mut() {
                    facenet.embedding(face)?;
                }
                all.push(faces);
            }
            Ok(all)
        }
    }
}

fn draw_faces(img: &mut RgbaImage, faces: &[Face]) {
    for face in faces {
        drawing::draw_hollow_rect_mut(
            img,
            face.bounding_box.into(),
            Rgba([0u8, 255u8, 0u8, 255u8]),
        );
        for p in face.facial_landmark.points() {
            drawing::draw_filled_circle_mut(img, (p.x, p.y), 2, Rgba([255u8, 0u8, 0u8, 255u8]));
        }
    }
}
