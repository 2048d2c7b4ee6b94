//! On-disk caches for alignments, embeddings and faces.
//!
//! Every cache lives in an existing root directory and keeps its entries as
//! one JSON document per key.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::RgbaImage;
use ndarray::Array1;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::config::INPUT_FACE_SIZE;
use crate::face::{Face, FaceEmbedding, FaceJson};
use crate::facenet::{Aligner, Embedder};
use crate::image_utils::{image_digest, load_image, resize_image, save_image};

#[derive(Serialize)]
struct EntryRef<'a, T: ?Sized> {
    key: &'a str,
    value: &'a T,
}

#[derive(Deserialize)]
struct Entry<T> {
    #[serde(default)]
    key: String,
    value: T,
}

fn ensure_root(root: &Path) -> Result<()> {
    if !root.is_dir() {
        bail!("directory not exist: {}", root.display());
    }
    Ok(())
}

/// Key value store backed by a directory of JSON files.
pub struct DbCache {
    dir: PathBuf,
}

impl DbCache {
    /// Opens `<root>/db.<name>`, or `<root>/db.default` without a name.
    pub fn new(root: &Path, name: Option<&str>) -> Result<DbCache> {
        ensure_root(root)?;
        let dir = root.join(format!("db.{}", name.unwrap_or("default")));
        fs::create_dir_all(&dir).with_context(|| format!("creating {dir:?}"))?;
        Ok(DbCache { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let hash = Sha256::digest(key.as_bytes());
        let name: String = hash.iter().map(|b| format!("{b:02x}")).collect();
        self.dir.join(format!("{name}.json"))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        trace!("DbCache get({key})");
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("reading {path:?}"))?;
        let entry: Entry<T> = serde_json::from_slice(&bytes)?;
        Ok(Some(entry.value))
    }

    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        trace!("DbCache put({key})");
        fs::create_dir_all(&self.dir)?;
        let path = self.entry_path(key);
        let mut writer = BufWriter::new(
            fs::File::create(&path).with_context(|| format!("creating {path:?}"))?,
        );
        serde_json::to_writer(&mut writer, &EntryRef { key, value })?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.entry_files()?.len())
    }

    /// Every stored `(key, value)` pair, sorted by key.
    pub fn list<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>> {
        let mut entries = Vec::new();
        for path in self.entry_files()? {
            let bytes = fs::read(&path).with_context(|| format!("reading {path:?}"))?;
            let entry: Entry<T> =
                serde_json::from_slice(&bytes).with_context(|| format!("parsing {path:?}"))?;
            entries.push((entry.key, entry.value));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    pub fn clean(&self) -> Result<()> {
        debug!("DbCache clean({:?})", self.dir);
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).with_context(|| format!("removing {:?}", self.dir))?;
        }
        Ok(())
    }
}

/// Embeddings keyed by face digest.
pub struct EmbeddingCache<E: Embedder> {
    embedder: E,
    db: DbCache,
}

impl<E: Embedder> EmbeddingCache<E> {
    pub fn new(embedder: E, root: &Path) -> Result<EmbeddingCache<E>> {
        Ok(EmbeddingCache {
            embedder,
            db: DbCache::new(root, Some("embedding"))?,
        })
    }

    pub fn embedder(&mut self) -> &mut E {
        &mut self.embedder
    }

    pub fn count(&self) -> Result<usize> {
        self.db.count()
    }

    pub fn clean(&self) -> Result<()> {
        self.db.clean()
    }
}

impl<E: Embedder> Embedder for EmbeddingCache<E> {
    fn embedding(&mut self, face: &mut Face) -> Result<FaceEmbedding> {
        if let Some(stored) = self.db.get::<Vec<f32>>(&face.digest)? {
            trace!("embedding({face}) cache HIT");
            let embedding = Array1::from(stored);
            if !face.has_embedding() {
                face.set_embedding(embedding.clone())?;
            }
            return Ok(embedding);
        }

        let embedding = self.embedder.embedding(face)?;
        self.db.put(&face.digest, &embedding.to_vec())?;
        trace!("embedding({face}) cache MISS");
        Ok(embedding)
    }
}

/// Alignment results keyed by image path or image digest.
pub struct AlignmentCache<A: Aligner> {
    aligner: A,
    db: DbCache,
}

impl<A: Aligner> AlignmentCache<A> {
    pub fn new(aligner: A, root: &Path) -> Result<AlignmentCache<A>> {
        Ok(AlignmentCache {
            aligner,
            db: DbCache::new(root, Some("alignment"))?,
        })
    }

    pub fn aligner(&mut self) -> &mut A {
        &mut self.aligner
    }

    pub fn into_inner(self) -> A {
        self.aligner
    }

    pub fn align_file(&mut self, path: impl AsRef<Path>) -> Result<Vec<Face>> {
        let path = path.as_ref();
        let key = path.to_string_lossy().into_owned();
        if let Some(faces) = self.lookup(&key)? {
            return Ok(faces);
        }
        let image = load_image(path)?;
        self.align_and_store(&key, &image)
    }

    pub fn count(&self) -> Result<usize> {
        self.db.count()
    }

    pub fn clean(&self) -> Result<()> {
        self.db.clean()
    }

    fn lookup(&self, key: &str) -> Result<Option<Vec<Face>>> {
        match self.db.get::<Vec<FaceJson>>(key)? {
            Some(list) => {
                trace!("align({key}) db HIT");
                let faces: Vec<Face> = list
                    .into_iter()
                    .map(Face::from_json)
                    .collect::<Result<_>>()?;
                Ok(Some(faces))
            }
            None => Ok(None),
        }
    }

    fn align_and_store(&mut self, key: &str, image: &RgbaImage) -> Result<Vec<Face>> {
        trace!("align({key}) db MISS");
        let faces = self.aligner.align(image)?;
        let list: Vec<FaceJson> = faces.iter().map(Face::to_json).collect();
        self.db.put(key, &list)?;
        Ok(faces)
    }
}

impl<A: Aligner> Aligner for AlignmentCache<A> {
    fn align(&mut self, image: &RgbaImage) -> Result<Vec<Face>> {
        let key = image_digest(image);
        if let Some(faces) = self.lookup(&key)? {
            return Ok(faces);
        }
        self.align_and_store(&key, image)
    }
}

/// Faces keyed by digest, with a 160x160 PNG of each under `cache.face/`.
pub struct FaceCache {
    db: DbCache,
    image_dir: PathBuf,
}

impl FaceCache {
    pub fn new(root: &Path) -> Result<FaceCache> {
        let db = DbCache::new(root, Some("face"))?;
        let image_dir = root.join("cache.face");
        fs::create_dir_all(&image_dir).with_context(|| format!("creating {image_dir:?}"))?;
        Ok(FaceCache { db, image_dir })
    }

    pub fn image_path(&self, digest: &str) -> PathBuf {
        self.image_dir.join(format!("{digest}.png"))
    }

    pub fn get(&self, digest: &str) -> Result<Option<Face>> {
        self.db
            .get::<FaceJson>(digest)?
            .map(Face::from_json)
            .transpose()
    }

    pub fn put(&self, face: &Face) -> Result<()> {
        self.db.put(&face.digest, &face.to_json())?;

        fs::create_dir_all(&self.image_dir)?;
        if face.width() != INPUT_FACE_SIZE || face.height() != INPUT_FACE_SIZE {
            let resized = resize_image(&face.image, INPUT_FACE_SIZE, INPUT_FACE_SIZE);
            save_image(&resized, self.image_path(&face.digest))
        } else {
            save_image(&face.image, self.image_path(&face.digest))
        }
    }

    pub fn count(&self) -> Result<usize> {
        self.db.count()
    }

    pub fn clean(&self) -> Result<()> {
        self.db.clean()?;
        if self.image_dir.exists() {
            fs::remove_dir_all(&self.image_dir)?;
        }
        Ok(())
    }
}
