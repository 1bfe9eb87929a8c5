//! Two-pass artifact writer
//!
//! Pass 1 serializes every row once to measure it: per-row ceiling, totals
//! for the single and JSONL forms, delta tuple sizes, ordering digest. The
//! budget decides the representation, then pass 2 writes it, either from
//! lines kept in memory during pass 1 or by reopening the source.
//!
//! Shards are staged in a private directory and swapped in whole, so a
//! failed write leaves the previous generation untouched. The meta is
//! staged alongside and renamed only after the shards are in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use codeidx_common::error::{Error, Result, RowError};
use codeidx_common::metrics;
use codeidx_common::types::{format_bytes, BudgetInfo, Compression, FormatPreference, OverflowMode};

use crate::atomic;
use crate::budget::{apply_budget, BudgetPolicy, BudgetReporter, TracingReporter};
use crate::compaction::{ColumnarBuilder, DeltaEncoder, DeltaSchema, FileIdLookup};
use crate::compression;
use crate::manifest::{
    ArtifactFormat, ArtifactMeta, ArtifactPaths, MetaExtensions, OffsetsExtension, PartEntry,
    PieceEntry, TrimExtension, OFFSETS_FORMAT, OFFSETS_SUFFIX, SCHEMA_VERSION,
};
use crate::offsets::OffsetsBuilder;
use crate::ordering::{OrderingDigest, OrderingHasher};
use crate::source::{RowIter, RowSource};
use crate::WriterOptions;

/// Upper bound on lines reserved up front from a source's row count hint
const MAX_PREALLOCATED_LINES: usize = 4096;

/// Delta layout plus the producer's file id mapping
#[derive(Debug, Clone, Copy)]
pub struct DeltaInput<'a> {
    pub schema: &'a DeltaSchema,
    pub files: &'a FileIdLookup,
}

/// What to write and under which policy
#[derive(Debug, Clone)]
pub struct ArtifactSpec<'a> {
    pub name: String,
    /// `type` of the emitted piece entries
    pub piece_type: String,
    pub policy: BudgetPolicy,
    /// Overrides [`WriterOptions::format`]
    pub format: Option<FormatPreference>,
    /// Overrides [`WriterOptions::compression`]
    pub compression: Option<Compression>,
    pub delta: Option<DeltaInput<'a>>,
    /// With `auto`, use the columnar form once the single form reaches this size
    pub columnar_min_bytes: Option<u64>,
}

impl<'a> ArtifactSpec<'a> {
    pub fn new(name: impl Into<String>, policy: BudgetPolicy) -> Self {
        let name = name.into();
        Self {
            piece_type: name.clone(),
            name,
            policy,
            format: None,
            compression: None,
            delta: None,
            columnar_min_bytes: None,
        }
    }

    pub fn with_piece_type(mut self, piece_type: impl Into<String>) -> Self {
        self.piece_type = piece_type.into();
        self
    }

    pub fn with_format(mut self, format: FormatPreference) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_delta(mut self, schema: &'a DeltaSchema, files: &'a FileIdLookup) -> Self {
        self.delta = Some(DeltaInput { schema, files });
        self
    }

    pub fn with_columnar_threshold(mut self, min_bytes: u64) -> Self {
        self.columnar_min_bytes = Some(min_bytes);
        self
    }
}

/// Outcome of one artifact write
#[derive(Debug, Clone)]
pub struct WriteResult {
    pub artifact: String,
    pub format: ArtifactFormat,
    pub compression: Compression,
    /// Rows written
    pub records: u64,
    /// Rows removed by the `drop` overflow mode
    pub dropped_rows: u64,
    /// Bytes on disk across the data files
    pub bytes: u64,
    pub parts: Vec<PartEntry>,
    pub pieces: Vec<PieceEntry>,
    pub budget: Option<BudgetInfo>,
    pub ordering: OrderingDigest,
    pub delta_encoded: bool,
    pub meta: Option<ArtifactMeta>,
}

/// Writes artifacts into one output directory
pub struct ShardedRowWriter {
    dir: PathBuf,
    options: WriterOptions,
    reporter: Arc<dyn BudgetReporter>,
}

/// Longest row prefix that fits under a limit
#[derive(Debug, Clone, Copy, Default)]
struct PrefixFit {
    limit: Option<u64>,
    bytes: u64,
    rows: u64,
    closed: bool,
}

impl PrefixFit {
    fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    fn push(&mut self, len: u64) {
        if self.closed {
            return;
        }
        match self.limit {
            Some(limit) if self.bytes + len > limit => self.closed = true,
            _ => {
                self.bytes += len;
                self.rows += 1;
            }
        }
    }
}

/// Pass-1 results
struct Measurement {
    rows: u64,
    json_bytes: u64,
    jsonl_bytes: u64,
    delta_bytes: u64,
    plain_fit: PrefixFit,
    delta_fit: PrefixFit,
    ordering: OrderingDigest,
    plain_lines: Option<Vec<Vec<u8>>>,
    delta_lines: Option<Vec<Vec<u8>>>,
}

/// Pass-2 line producer. Lines carry no trailing newline.
enum Lines<'s, 'e, 'd> {
    Buffered(std::vec::IntoIter<Vec<u8>>),
    Plain(RowIter<'s>),
    Delta(RowIter<'s>, &'e mut DeltaEncoder<'d>),
}

impl Iterator for Lines<'_, '_, '_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Lines::Buffered(lines) => lines.next().map(Ok),
            Lines::Plain(rows) => rows
                .next()
                .map(|row| -> Result<Vec<u8>> { Ok(serde_json::to_vec(&row?)?) }),
            Lines::Delta(rows, encoder) => rows.next().map(|row| -> Result<Vec<u8>> {
                let row = row?;
                let tuple = encoder.encode_row(&row).ok_or_else(|| {
                    Error::Internal("row source changed between passes".to_string())
                })?;
                Ok(serde_json::to_vec(&tuple)?)
            }),
        }
    }
}

/// Shards written to staging
struct ShardOutput {
    parts: Vec<PartEntry>,
    offsets: Vec<String>,
    records: u64,
}

impl ShardedRowWriter {
    pub fn new(dir: impl Into<PathBuf>, options: WriterOptions) -> Self {
        Self {
            dir: dir.into(),
            options,
            reporter: Arc::new(TracingReporter),
        }
    }

    /// Route budget warnings and checkpoints somewhere other than tracing
    pub fn with_reporter(mut self, reporter: Arc<dyn BudgetReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Measure, decide and write one artifact, replacing whatever form it
    /// had before.
    pub async fn write(&self, spec: &ArtifactSpec<'_>, source: &dyn RowSource) -> Result<WriteResult> {
        if self.options.max_json_bytes == 0 {
            return Err(Error::InvalidParameter(
                "max_json_bytes must be a positive byte count".to_string(),
            ));
        }
        let paths = ArtifactPaths::new(&self.dir, &spec.name)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let format = spec.format.unwrap_or(self.options.format);
        let compression = spec.compression.unwrap_or(self.options.compression);
        let mut encoder = spec.delta.map(|d| DeltaEncoder::new(d.schema, d.files));
        let wants_columnar = format == FormatPreference::Columnar
            || (format == FormatPreference::Auto && spec.columnar_min_bytes.is_some());
        let mut columnar = wants_columnar.then(ColumnarBuilder::new);

        let mut measured = self.measure(spec, source, encoder.as_mut(), columnar.as_mut())?;

        if let Some(reason) = encoder.as_ref().and_then(DeltaEncoder::disabled_reason) {
            info!("[delta] {}: writing plain rows, {}", spec.name, reason);
        }
        let delta_active = measured.rows > 0 && encoder.as_ref().is_some_and(DeltaEncoder::is_enabled);
        if !delta_active {
            encoder = None;
        }

        let observed = if delta_active {
            measured.delta_bytes
        } else {
            measured.jsonl_bytes
        };
        let budget = apply_budget(&spec.policy, observed, &spec.name, self.reporter.as_ref())?;

        let over = budget.is_some_and(|b| b.is_over());
        let keep = if over && spec.policy.overflow == OverflowMode::Drop {
            if delta_active {
                measured.delta_fit.rows
            } else {
                measured.plain_fit.rows
            }
        } else {
            measured.rows
        };
        let dropped = measured.rows - keep;
        if dropped > 0 {
            metrics::record_rows_dropped(&spec.name, dropped);
            warn!(
                "[byte-budget] {} dropped {} of {} rows to fit budget",
                spec.name, dropped, measured.rows
            );
        }

        let single_limit = spec
            .policy
            .max_bytes
            .map_or(self.options.max_json_bytes, |b| b.min(self.options.max_json_bytes));

        // columnar is a single-file form: same size limit, never over budget
        if let Some(builder) = columnar.take() {
            let large_enough = format == FormatPreference::Columnar
                || measured.json_bytes >= spec.columnar_min_bytes.unwrap_or(0);
            if builder.is_eligible() && large_enough && !over && !delta_active {
                let mut body = serde_json::to_vec(&builder.finish()?)?;
                body.push(b'\n');
                if body.len() as u64 <= single_limit {
                    return self
                        .write_columnar(spec, &paths, compression, &body, measured, budget)
                        .await;
                }
                debug!(
                    "[columnar] {}: payload of {} exceeds {}",
                    spec.name,
                    format_bytes(body.len() as u64),
                    format_bytes(single_limit)
                );
            } else if let Some(reason) = builder.ineligible_reason() {
                debug!("[columnar] {}: {}", spec.name, reason);
            }
        }

        let single = !delta_active
            && dropped == 0
            && format != FormatPreference::Jsonl
            && measured.json_bytes <= single_limit;

        let buffered = if delta_active {
            measured.delta_lines.take()
        } else {
            measured.plain_lines.take()
        };
        let lines = match (buffered, encoder.as_mut()) {
            (Some(lines), _) => Lines::Buffered(lines.into_iter()),
            (None, Some(encoder)) => Lines::Delta(source.open()?, encoder),
            (None, None) => Lines::Plain(source.open()?),
        };

        if single {
            return self.write_single(spec, &paths, compression, lines, measured, budget).await;
        }

        let target = self.shard_target(&spec.policy);
        let staging = atomic::temp_path_for(&paths.parts_dir());
        tokio::fs::create_dir_all(&staging).await?;
        let output = match self.stage_shards(&paths, &staging, compression, lines, keep, target).await {
            Ok(output) => output,
            Err(e) => {
                let _ = atomic::remove_dir_if_exists(&staging).await;
                return Err(e);
            }
        };
        let delta = encoder.as_ref().map(DeltaEncoder::extension);

        let extensions = MetaExtensions {
            offsets: (!compression.is_compressed() && !output.parts.is_empty()).then(|| OffsetsExtension {
                format: OFFSETS_FORMAT.to_string(),
                suffix: OFFSETS_SUFFIX.to_string(),
                parts: output.offsets.clone(),
            }),
            delta,
            trim: (dropped > 0).then_some(TrimExtension {
                dropped_rows: dropped,
                kept_rows: keep,
            }),
            ordering: Some(measured.ordering.clone()),
        };
        let meta = ArtifactMeta {
            schema_version: SCHEMA_VERSION.to_string(),
            artifact: spec.name.clone(),
            format: ArtifactFormat::JsonlSharded,
            generated_at: chrono::Utc::now().to_rfc3339(),
            compression,
            total_records: output.records,
            total_bytes: output.parts.iter().map(|p| p.bytes).sum(),
            max_part_records: output.parts.iter().map(|p| p.records).max().unwrap_or(0),
            max_part_bytes: output.parts.iter().map(|p| p.bytes).max().unwrap_or(0),
            target_max_bytes: target,
            parts: output.parts.clone(),
            extensions,
        };
        self.publish_shards(&paths, &staging, &meta).await?;
        self.remove_single_variants(&paths).await?;
        self.remove_columnar_variants(&paths, None).await?;

        let mut pieces: Vec<PieceEntry> = output
            .parts
            .iter()
            .map(|part| PieceEntry {
                piece_type: spec.piece_type.clone(),
                name: spec.name.clone(),
                format: "jsonl".to_string(),
                compression: compression.is_compressed().then_some(compression),
                count: Some(part.records),
                path: part.path.clone(),
            })
            .collect();
        pieces.extend(output.offsets.iter().zip(&output.parts).map(|(path, part)| PieceEntry {
            piece_type: spec.piece_type.clone(),
            name: format!("{}_offsets", spec.name),
            format: "bin".to_string(),
            compression: None,
            count: Some(part.records),
            path: path.clone(),
        }));
        pieces.push(meta_piece(spec, &paths));

        let result = WriteResult {
            artifact: spec.name.clone(),
            format: ArtifactFormat::JsonlSharded,
            compression,
            records: output.records,
            dropped_rows: dropped,
            bytes: meta.total_bytes,
            parts: output.parts,
            pieces,
            budget,
            ordering: measured.ordering,
            delta_encoded: delta_active,
            meta: Some(meta),
        };
        log_written(&result);
        Ok(result)
    }

    fn shard_target(&self, policy: &BudgetPolicy) -> u64 {
        if self.options.shard_target_bytes > 0 {
            return self.options.shard_target_bytes;
        }
        policy
            .max_bytes
            .map_or(self.options.max_json_bytes, |b| b.min(self.options.max_json_bytes))
            .max(1)
    }

    /// Pass 1
    fn measure(
        &self,
        spec: &ArtifactSpec<'_>,
        source: &dyn RowSource,
        mut encoder: Option<&mut DeltaEncoder<'_>>,
        mut columnar: Option<&mut ColumnarBuilder>,
    ) -> Result<Measurement> {
        let limit = self.options.max_json_bytes;
        let buffer_limit = self.options.buffer_limit_bytes;
        let mut ordering = OrderingHasher::new();
        let capacity = source.len_hint().unwrap_or(0).min(MAX_PREALLOCATED_LINES);
        let mut m = Measurement {
            rows: 0,
            json_bytes: 0,
            jsonl_bytes: 0,
            delta_bytes: 0,
            plain_fit: PrefixFit::new(spec.policy.max_bytes),
            delta_fit: PrefixFit::new(spec.policy.max_bytes),
            ordering: OrderingDigest::default(),
            plain_lines: (buffer_limit > 0).then(|| Vec::with_capacity(capacity)),
            delta_lines: (buffer_limit > 0 && encoder.is_some()).then(|| Vec::with_capacity(capacity)),
        };
        let mut buffered_bytes = 0u64;

        for (index, row) in source.open()?.enumerate() {
            let row = row?;
            let line = serde_json::to_vec(&row)?;
            let line_len = line.len() as u64 + 1;
            if line_len > limit {
                return Err(RowError::Oversize {
                    bytes: line_len,
                    limit,
                    context: format!("{} row {}", spec.name, index),
                }
                .into());
            }

            ordering.update(&line);
            m.rows += 1;
            m.jsonl_bytes += line_len;
            m.json_bytes += line.len() as u64 + u64::from(index > 0);
            m.plain_fit.push(line_len);

            if let Some(encoder) = encoder.as_deref_mut() {
                match encoder.encode_row(&row) {
                    Some(tuple) => {
                        let delta_line = serde_json::to_vec(&tuple)?;
                        m.delta_bytes += delta_line.len() as u64 + 1;
                        m.delta_fit.push(delta_line.len() as u64 + 1);
                        buffered_bytes += delta_line.len() as u64;
                        if let Some(lines) = m.delta_lines.as_mut() {
                            lines.push(delta_line);
                        }
                    }
                    None => m.delta_lines = None,
                }
            }
            if let Some(builder) = columnar.as_deref_mut() {
                builder.push(&row);
            }

            buffered_bytes += line.len() as u64;
            if buffered_bytes > buffer_limit {
                m.plain_lines = None;
                m.delta_lines = None;
            }
            if let Some(lines) = m.plain_lines.as_mut() {
                lines.push(line);
            }
        }

        // "[" + rows joined by "," + "]\n"
        m.json_bytes += 3;
        m.ordering = ordering.finish();
        Ok(m)
    }

    async fn write_single(
        &self,
        spec: &ArtifactSpec<'_>,
        paths: &ArtifactPaths,
        compression: Compression,
        lines: Lines<'_, '_, '_>,
        measured: Measurement,
        budget: Option<BudgetInfo>,
    ) -> Result<WriteResult> {
        let mut body = Vec::with_capacity(usize::try_from(measured.json_bytes).unwrap_or(0));
        body.push(b'[');
        let mut records = 0u64;
        for line in lines {
            if records > 0 {
                body.push(b',');
            }
            body.extend_from_slice(&line?);
            records += 1;
        }
        body.extend_from_slice(b"]\n");
        check_second_pass(records, measured.rows)?;

        let data = compression::encode(&body, compression)?;
        let target = paths.single(compression);
        atomic::write_atomic(&target, &data).await?;

        for other in Compression::ALL {
            if other != compression {
                atomic::remove_file_if_exists(&paths.single(other)).await?;
            }
        }
        atomic::remove_dir_if_exists(&paths.parts_dir()).await?;
        atomic::remove_file_if_exists(&paths.meta()).await?;
        self.remove_columnar_variants(paths, None).await?;

        let file_name = paths.single_file_name(compression);
        let part = PartEntry {
            path: file_name.clone(),
            records,
            bytes: data.len() as u64,
        };
        let result = WriteResult {
            artifact: spec.name.clone(),
            format: ArtifactFormat::Json,
            compression,
            records,
            dropped_rows: 0,
            bytes: part.bytes,
            parts: vec![part],
            pieces: vec![PieceEntry {
                piece_type: spec.piece_type.clone(),
                name: spec.name.clone(),
                format: "json".to_string(),
                compression: compression.is_compressed().then_some(compression),
                count: Some(records),
                path: file_name,
            }],
            budget,
            ordering: measured.ordering,
            delta_encoded: false,
            meta: None,
        };
        log_written(&result);
        Ok(result)
    }

    async fn write_columnar(
        &self,
        spec: &ArtifactSpec<'_>,
        paths: &ArtifactPaths,
        compression: Compression,
        body: &[u8],
        measured: Measurement,
        budget: Option<BudgetInfo>,
    ) -> Result<WriteResult> {
        let data = compression::encode(body, compression)?;
        atomic::write_atomic(&paths.columnar(compression), &data).await?;

        let part = PartEntry {
            path: paths.columnar_file_name(compression),
            records: measured.rows,
            bytes: data.len() as u64,
        };
        let meta = ArtifactMeta {
            schema_version: SCHEMA_VERSION.to_string(),
            artifact: spec.name.clone(),
            format: ArtifactFormat::Columnar,
            generated_at: chrono::Utc::now().to_rfc3339(),
            compression,
            total_records: measured.rows,
            total_bytes: part.bytes,
            max_part_records: measured.rows,
            max_part_bytes: part.bytes,
            target_max_bytes: 0,
            parts: vec![part.clone()],
            extensions: MetaExtensions {
                ordering: Some(measured.ordering.clone()),
                ..MetaExtensions::default()
            },
        };
        atomic::write_atomic(&paths.meta(), &serde_json::to_vec_pretty(&meta)?).await?;
        self.remove_single_variants(paths).await?;
        self.remove_columnar_variants(paths, Some(compression)).await?;
        atomic::remove_dir_if_exists(&paths.parts_dir()).await?;

        let result = WriteResult {
            artifact: spec.name.clone(),
            format: ArtifactFormat::Columnar,
            compression,
            records: measured.rows,
            dropped_rows: 0,
            bytes: part.bytes,
            pieces: vec![
                PieceEntry {
                    piece_type: spec.piece_type.clone(),
                    name: spec.name.clone(),
                    format: "columnar".to_string(),
                    compression: compression.is_compressed().then_some(compression),
                    count: Some(measured.rows),
                    path: part.path.clone(),
                },
                meta_piece(spec, paths),
            ],
            parts: vec![part],
            budget,
            ordering: measured.ordering,
            delta_encoded: false,
            meta: Some(meta),
        };
        log_written(&result);
        Ok(result)
    }

    /// Swap staged shards into place, then the meta describing them.
    ///
    /// The meta is renamed last, so a reader holding it never sees parts
    /// from an older generation than the one it declares.
    async fn publish_shards(&self, paths: &ArtifactPaths, staging: &Path, meta: &ArtifactMeta) -> Result<()> {
        let staged_meta = atomic::temp_path_for(&paths.meta());
        let published = async {
            atomic::write_synced(&staged_meta, &serde_json::to_vec_pretty(meta)?).await?;
            atomic::publish_dir(staging, &paths.parts_dir()).await?;
            atomic::publish_file(&staged_meta, &paths.meta()).await
        }
        .await;
        if published.is_err() {
            let _ = atomic::remove_file_if_exists(&staged_meta).await;
            let _ = atomic::remove_dir_if_exists(staging).await;
        }
        published
    }

    /// Pass 2 for the sharded form: write every shard into `staging`
    async fn stage_shards(
        &self,
        paths: &ArtifactPaths,
        staging: &Path,
        compression: Compression,
        lines: Lines<'_, '_, '_>,
        keep: u64,
        target: u64,
    ) -> Result<ShardOutput> {
        let mut output = ShardOutput {
            parts: Vec::new(),
            offsets: Vec::new(),
            records: 0,
        };
        let mut buf: Vec<u8> = Vec::new();
        let mut offsets = OffsetsBuilder::new();

        for line in lines.take(usize::try_from(keep).unwrap_or(usize::MAX)) {
            let mut line = line?;
            line.push(b'\n');
            let line_len = line.len() as u64;
            // a shard always takes at least one row, even an oversize one
            if !offsets.is_empty() && offsets.position() + line_len > target {
                self.flush_shard(paths, staging, compression, &mut buf, &mut offsets, &mut output)
                    .await?;
            }
            offsets.push_line(line_len);
            buf.extend_from_slice(&line);
            output.records += 1;
        }
        if !offsets.is_empty() {
            self.flush_shard(paths, staging, compression, &mut buf, &mut offsets, &mut output)
                .await?;
        }
        check_second_pass(output.records, keep)?;
        Ok(output)
    }

    async fn flush_shard(
        &self,
        paths: &ArtifactPaths,
        staging: &Path,
        compression: Compression,
        buf: &mut Vec<u8>,
        offsets: &mut OffsetsBuilder,
        output: &mut ShardOutput,
    ) -> Result<()> {
        let index = output.parts.len();
        let file_name = paths.part_file_name(index, compression);
        let data = compression::encode(buf, compression)?;
        atomic::write_synced(&staging.join(&file_name), &data).await?;

        if !compression.is_compressed() {
            let sidecar = ArtifactPaths::offsets_file_name(&file_name);
            atomic::write_synced(&staging.join(&sidecar), &offsets.to_bytes()).await?;
            output
                .offsets
                .push(format!("{}/{}", paths.parts_dir_name(), sidecar));
        }

        let records = offsets.len() as u64;
        debug!(
            "[shard] {} part {} ({} rows, {})",
            paths.name(),
            index,
            records,
            format_bytes(data.len() as u64)
        );
        metrics::record_shard_written(paths.name(), data.len() as u64);
        output.parts.push(PartEntry {
            path: paths.part_rel(index, compression),
            records,
            bytes: data.len() as u64,
        });
        buf.clear();
        offsets.clear();
        Ok(())
    }

    async fn remove_single_variants(&self, paths: &ArtifactPaths) -> Result<()> {
        for compression in Compression::ALL {
            atomic::remove_file_if_exists(&paths.single(compression)).await?;
        }
        Ok(())
    }

    async fn remove_columnar_variants(&self, paths: &ArtifactPaths, keep: Option<Compression>) -> Result<()> {
        for compression in Compression::ALL {
            if Some(compression) != keep {
                atomic::remove_file_if_exists(&paths.columnar(compression)).await?;
            }
        }
        Ok(())
    }
}

fn check_second_pass(written: u64, expected: u64) -> Result<()> {
    if written != expected {
        return Err(Error::Internal(format!(
            "row source yielded {written} rows on the second pass, expected {expected}"
        )));
    }
    Ok(())
}

fn meta_piece(spec: &ArtifactSpec<'_>, paths: &ArtifactPaths) -> PieceEntry {
    PieceEntry {
        piece_type: spec.piece_type.clone(),
        name: format!("{}_meta", spec.name),
        format: "json".to_string(),
        compression: None,
        count: None,
        path: paths.meta_file_name(),
    }
}

fn log_written(result: &WriteResult) {
    metrics::record_artifact_written(
        &result.artifact,
        result.format.as_str(),
        result.records,
        result.bytes,
    );
    info!(
        "[artifact] wrote {} as {} ({} rows, {} parts, {})",
        result.artifact,
        result.format,
        result.records,
        result.parts.len(),
        format_bytes(result.bytes)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::StageCheckpoints;
    use crate::offsets;
    use crate::source::{Row, VecSource};
    use serde_json::{json, Value};

    fn rows(n: usize) -> VecSource {
        VecSource::from_values(
            (0..n)
                .map(|i| json!({"id": i, "value": format!("row-{i}")}))
                .collect(),
        )
        .unwrap()
    }

    fn options() -> WriterOptions {
        WriterOptions {
            max_json_bytes: 1 << 20,
            compression: Compression::None,
            shard_target_bytes: 0,
            buffer_limit_bytes: 1 << 20,
            format: FormatPreference::Auto,
        }
    }

    async fn exists(path: PathBuf) -> bool {
        tokio::fs::try_exists(path).await.unwrap()
    }

    #[tokio::test]
    async fn test_small_artifact_is_single_json() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ShardedRowWriter::new(dir.path(), options());
        let spec = ArtifactSpec::new("file_meta", BudgetPolicy::unlimited("file_meta"));

        let result = writer.write(&spec, &rows(3)).await.unwrap();
        assert_eq!(result.format, ArtifactFormat::Json);
        assert_eq!(result.records, 3);

        let body = tokio::fs::read(dir.path().join("file_meta.json")).await.unwrap();
        let parsed: Vec<Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed[2], json!({"id": 2, "value": "row-2"}));
        assert!(body.ends_with(b"]\n"));
        assert_eq!(result.pieces.len(), 1);
    }

    #[tokio::test]
    async fn test_forced_jsonl_shards_and_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options();
        opts.shard_target_bytes = 200;
        let writer = ShardedRowWriter::new(dir.path(), opts);
        let spec = ArtifactSpec::new("call_sites", BudgetPolicy::unlimited("call_sites"))
            .with_format(FormatPreference::Jsonl);

        let result = writer.write(&spec, &rows(25)).await.unwrap();
        assert_eq!(result.format, ArtifactFormat::JsonlSharded);
        assert!(result.parts.len() >= 2);
        assert_eq!(result.parts.iter().map(|p| p.records).sum::<u64>(), 25);

        let meta = result.meta.unwrap();
        assert_eq!(meta.total_records, 25);
        let offsets_ext = meta.extensions.offsets.unwrap();
        assert_eq!(offsets_ext.parts.len(), result.parts.len());
        for (part, sidecar) in result.parts.iter().zip(&offsets_ext.parts) {
            assert!(part.bytes <= 200);
            let jsonl = dir.path().join(&part.path);
            let sidecar = dir.path().join(sidecar);
            offsets::validate_against_file(&jsonl, &sidecar).await.unwrap();
            assert_eq!(offsets::count(&sidecar).await.unwrap(), part.records);
        }
        assert!(exists(dir.path().join("call_sites.meta.json")).await);
        // parts, sidecars and the meta
        assert_eq!(result.pieces.len(), result.parts.len() * 2 + 1);
    }

    #[tokio::test]
    async fn test_representation_switch_removes_stale_variant() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ShardedRowWriter::new(dir.path(), options());
        let single = ArtifactSpec::new("symbols", BudgetPolicy::unlimited("symbols"));
        let sharded = single.clone().with_format(FormatPreference::Jsonl);

        writer.write(&single, &rows(4)).await.unwrap();
        assert!(exists(dir.path().join("symbols.json")).await);

        writer.write(&sharded, &rows(4)).await.unwrap();
        assert!(!exists(dir.path().join("symbols.json")).await);
        assert!(exists(dir.path().join("symbols.parts")).await);

        writer.write(&single, &rows(4)).await.unwrap();
        assert!(exists(dir.path().join("symbols.json")).await);
        assert!(!exists(dir.path().join("symbols.parts")).await);
        assert!(!exists(dir.path().join("symbols.meta.json")).await);
    }

    #[tokio::test]
    async fn test_oversize_row_rejected_in_measurement() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options();
        opts.max_json_bytes = 16;
        let writer = ShardedRowWriter::new(dir.path(), opts);
        let spec = ArtifactSpec::new("chunk_meta", BudgetPolicy::unlimited("chunk_meta"));

        let err = writer.write(&spec, &rows(2)).await.unwrap_err();
        assert!(matches!(err, Error::Row(RowError::Oversize { limit: 16, .. })));
        assert!(!exists(dir.path().join("chunk_meta.json")).await);
    }

    #[tokio::test]
    async fn test_fatal_budget_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ShardedRowWriter::new(dir.path(), options());
        let policy = BudgetPolicy {
            artifact: "vfs_manifest".to_string(),
            max_bytes: Some(10),
            overflow: OverflowMode::Fail,
            strict: false,
        };
        let err = writer
            .write(&ArtifactSpec::new("vfs_manifest", policy), &rows(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ERR_BYTE_BUDGET_EXCEEDED");
        assert!(!exists(dir.path().join("vfs_manifest.json")).await);
    }

    #[tokio::test]
    async fn test_drop_overflow_keeps_fitting_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Arc::new(StageCheckpoints::new());
        let writer = ShardedRowWriter::new(dir.path(), options()).with_reporter(reporter.clone());
        let line_len = serde_json::to_vec(&json!({"id": 0, "value": "row-0"})).unwrap().len() as u64 + 1;
        let policy = BudgetPolicy {
            artifact: "graph_relations".to_string(),
            max_bytes: Some(line_len * 3),
            overflow: OverflowMode::Drop,
            strict: false,
        };

        let result = writer
            .write(&ArtifactSpec::new("graph_relations", policy), &rows(8))
            .await
            .unwrap();
        assert_eq!(result.records, 3);
        assert_eq!(result.dropped_rows, 5);
        let trim = result.meta.unwrap().extensions.trim.unwrap();
        assert_eq!((trim.kept_rows, trim.dropped_rows), (3, 5));
        assert_eq!(reporter.warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_delta_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ShardedRowWriter::new(dir.path(), options());
        let schema = DeltaSchema::repo_map();
        let files = FileIdLookup::from_paths(["src/a.rs", "src/b.rs"]);
        let source = VecSource::from_values(vec![
            json!({"file": "src/a.rs", "name": "main", "kind": "fn", "startLine": 1}),
            json!({"file": "src/b.rs", "name": "Thing", "kind": "struct", "startLine": 9}),
        ])
        .unwrap();
        let spec = ArtifactSpec::new("repo_map", BudgetPolicy::unlimited("repo_map")).with_delta(&schema, &files);

        let result = writer.write(&spec, &source).await.unwrap();
        assert!(result.delta_encoded);
        let delta = result.meta.unwrap().extensions.delta.unwrap();
        assert_eq!(delta.row, vec!["file", "name", "kind", "signature", "startLine"]);

        let shard = tokio::fs::read_to_string(dir.path().join(&result.parts[0].path)).await.unwrap();
        let first: Value = serde_json::from_str(shard.lines().next().unwrap()).unwrap();
        assert!(first.is_array());
        let row: Row = delta.inflate(&first, &files, 0).unwrap();
        assert_eq!(row, source.rows()[0]);
    }

    #[tokio::test]
    async fn test_compressed_shards_skip_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options();
        opts.compression = Compression::Zstd;
        opts.shard_target_bytes = 100;
        let writer = ShardedRowWriter::new(dir.path(), opts);
        let spec = ArtifactSpec::new("token_postings", BudgetPolicy::unlimited("token_postings"))
            .with_format(FormatPreference::Jsonl);

        let result = writer.write(&spec, &rows(10)).await.unwrap();
        assert!(result.parts[0].path.ends_with(".jsonl.zst"));
        let meta = result.meta.unwrap();
        assert_eq!(meta.compression, Compression::Zstd);
        assert!(meta.extensions.offsets.is_none());
    }

    #[tokio::test]
    async fn test_columnar_preference() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ShardedRowWriter::new(dir.path(), options());
        let spec = ArtifactSpec::new("file_meta", BudgetPolicy::unlimited("file_meta"))
            .with_format(FormatPreference::Columnar);

        let result = writer.write(&spec, &rows(6)).await.unwrap();
        assert_eq!(result.format, ArtifactFormat::Columnar);
        assert!(exists(dir.path().join("file_meta.columnar.json")).await);
        assert_eq!(result.meta.unwrap().format, ArtifactFormat::Columnar);
    }

    #[tokio::test]
    async fn test_columnar_honours_compression() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ShardedRowWriter::new(dir.path(), options());
        let spec = ArtifactSpec::new("token_postings", BudgetPolicy::unlimited("token_postings"))
            .with_format(FormatPreference::Columnar);

        writer.write(&spec, &rows(6)).await.unwrap();
        let spec = spec.with_compression(Compression::Zstd);
        let result = writer.write(&spec, &rows(6)).await.unwrap();
        assert_eq!(result.format, ArtifactFormat::Columnar);
        assert_eq!(result.compression, Compression::Zstd);
        assert_eq!(result.meta.unwrap().compression, Compression::Zstd);
        assert!(exists(dir.path().join("token_postings.columnar.json.zst")).await);
        assert!(!exists(dir.path().join("token_postings.columnar.json")).await);
    }

    #[tokio::test]
    async fn test_columnar_over_budget_falls_back_to_shards() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ShardedRowWriter::new(dir.path(), options());
        let policy = BudgetPolicy {
            artifact: "file_meta".to_string(),
            max_bytes: Some(100),
            overflow: OverflowMode::Shard,
            strict: false,
        };
        let spec = ArtifactSpec::new("file_meta", policy).with_format(FormatPreference::Columnar);

        let result = writer.write(&spec, &rows(25)).await.unwrap();
        assert_eq!(result.format, ArtifactFormat::JsonlSharded);
        assert!(result.budget.unwrap().is_over());
        assert!(result.parts.iter().all(|p| p.bytes <= 100));
        assert!(!exists(dir.path().join("file_meta.columnar.json")).await);
    }

    #[tokio::test]
    async fn test_columnar_payload_above_single_limit_is_sharded() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options();
        opts.max_json_bytes = 120;
        let writer = ShardedRowWriter::new(dir.path(), opts);
        let spec = ArtifactSpec::new("file_meta", BudgetPolicy::unlimited("file_meta"))
            .with_format(FormatPreference::Columnar);

        let result = writer.write(&spec, &rows(25)).await.unwrap();
        assert_eq!(result.format, ArtifactFormat::JsonlSharded);
        assert_eq!(result.records, 25);
        assert!(!exists(dir.path().join("file_meta.columnar.json")).await);
    }
}
