//! Result database
//!
//! Embedded relational store for a finished diff, loadable by UI
//! front-ends: one row per function match with its metadata, nested
//! basic-block and instruction matches, and the two file records. A
//! separate temporary database records in-progress manual-match edits so
//! a crashed session can be replayed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::differ::Program;
use crate::error::{DiffError, Result};
use crate::matching::context::MatchingContext;
use crate::matching::fixed_points::{FixedPointStore, InstructionMatch};
use crate::matching::steps::names;
use crate::statistics;
use crate::writers::ResultWriter;
use crate::Address;

const DATABASE_VERSION: &str = "bindelta 1";

/// Writes one diff into a fresh database file.
pub struct DatabaseWriter {
    path: PathBuf,
}

impl DatabaseWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DatabaseWriter { path: path.into() }
    }

    fn init_schema(connection: &Connection) -> Result<()> {
        connection.execute_batch(
            "CREATE TABLE metadata (
                version TEXT NOT NULL,
                similarity DOUBLE NOT NULL,
                confidence DOUBLE NOT NULL
            );
            CREATE TABLE file (
                id INTEGER PRIMARY KEY,
                filename TEXT NOT NULL,
                exefilename TEXT,
                hash TEXT
            );
            CREATE TABLE functionalgorithm (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            CREATE TABLE function (
                id INTEGER PRIMARY KEY,
                address1 INTEGER NOT NULL,
                name1 TEXT,
                address2 INTEGER NOT NULL,
                name2 TEXT,
                similarity DOUBLE NOT NULL,
                confidence DOUBLE NOT NULL,
                flags INTEGER NOT NULL,
                algorithm INTEGER NOT NULL REFERENCES functionalgorithm(id),
                commentsported INTEGER NOT NULL,
                basicblocks INTEGER NOT NULL,
                instructions INTEGER NOT NULL
            );
            CREATE TABLE basicblockalgorithm (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            CREATE TABLE basicblock (
                id INTEGER PRIMARY KEY,
                functionid INTEGER NOT NULL REFERENCES function(id),
                address1 INTEGER NOT NULL,
                address2 INTEGER NOT NULL,
                algorithm INTEGER NOT NULL REFERENCES basicblockalgorithm(id)
            );
            CREATE TABLE instruction (
                basicblockid INTEGER NOT NULL REFERENCES basicblock(id),
                address1 INTEGER NOT NULL,
                address2 INTEGER NOT NULL
            );
            CREATE INDEX idx_basicblock_function ON basicblock(functionid);
            CREATE INDEX idx_instruction_basicblock ON instruction(basicblockid);",
        )?;
        Ok(())
    }
}

impl ResultWriter for DatabaseWriter {
    fn write(&mut self, context: &MatchingContext) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let mut connection = Connection::open(&self.path)?;
        Self::init_schema(&connection)?;

        let scores = {
            let mut histogram = statistics::Histogram::new();
            let mut counts = statistics::Counts::default();
            statistics::counts_and_histogram(
                context.primary,
                context.secondary,
                &context.fixed_points,
                &mut histogram,
                &mut counts,
            );
            (
                statistics::global_similarity(
                    &context.primary.call_graph,
                    &context.secondary.call_graph,
                    &histogram,
                    &counts,
                    &context.confidences,
                ),
                statistics::confidence(&histogram, &context.confidences),
            )
        };

        let transaction = connection.transaction()?;
        transaction.execute(
            "INSERT INTO metadata (version, similarity, confidence) VALUES (?1, ?2, ?3)",
            params![DATABASE_VERSION, scores.0, scores.1],
        )?;
        for (id, call_graph) in [
            (1i64, &context.primary.call_graph),
            (2i64, &context.secondary.call_graph),
        ] {
            transaction.execute(
                "INSERT INTO file (id, filename, exefilename, hash) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id,
                    call_graph.file_name(),
                    call_graph.exe_filename(),
                    call_graph.exe_hash()
                ],
            )?;
        }

        // Algorithm tables, ids in order of first appearance.
        let mut function_algorithms: HashMap<&'static str, i64> = HashMap::new();
        let mut basic_block_algorithms: HashMap<&'static str, i64> = HashMap::new();
        for fixed_point in context.fixed_points.iter() {
            let next = function_algorithms.len() as i64 + 1;
            function_algorithms.entry(fixed_point.step()).or_insert(next);
            for basic_block in fixed_point.basic_blocks() {
                let next = basic_block_algorithms.len() as i64 + 1;
                basic_block_algorithms.entry(basic_block.step()).or_insert(next);
            }
        }
        for (name, id) in &function_algorithms {
            transaction.execute(
                "INSERT INTO functionalgorithm (id, name) VALUES (?1, ?2)",
                params![id, name],
            )?;
        }
        for (name, id) in &basic_block_algorithms {
            transaction.execute(
                "INSERT INTO basicblockalgorithm (id, name) VALUES (?1, ?2)",
                params![id, name],
            )?;
        }

        let mut function_id = 0i64;
        let mut basic_block_id = 0i64;
        for fixed_point in context.fixed_points.iter() {
            function_id += 1;
            let primary = context.primary.flow_graph(fixed_point.primary());
            let secondary = context.secondary.flow_graph(fixed_point.secondary());
            let instruction_matches: usize = fixed_point
                .basic_blocks()
                .map(|bb| bb.instruction_matches().len())
                .sum();
            transaction.execute(
                "INSERT INTO function (id, address1, name1, address2, name2, similarity, \
                 confidence, flags, algorithm, commentsported, basicblocks, instructions) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    function_id,
                    fixed_point.primary_entry() as i64,
                    primary.name(),
                    fixed_point.secondary_entry() as i64,
                    secondary.name(),
                    fixed_point.similarity(),
                    fixed_point.confidence(),
                    fixed_point.flags(),
                    function_algorithms[fixed_point.step()],
                    fixed_point.comments_ported() as i64,
                    fixed_point.basic_block_count() as i64,
                    instruction_matches as i64,
                ],
            )?;
            for basic_block in fixed_point.basic_blocks() {
                basic_block_id += 1;
                transaction.execute(
                    "INSERT INTO basicblock (id, functionid, address1, address2, algorithm) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        basic_block_id,
                        function_id,
                        primary.address(basic_block.primary_vertex) as i64,
                        secondary.address(basic_block.secondary_vertex) as i64,
                        basic_block_algorithms[basic_block.step()],
                    ],
                )?;
                for instruction_match in basic_block.instruction_matches() {
                    transaction.execute(
                        "INSERT INTO instruction (basicblockid, address1, address2) \
                         VALUES (?1, ?2, ?3)",
                        params![
                            basic_block_id,
                            primary.all_instructions()[instruction_match.primary as usize].address
                                as i64,
                            secondary.all_instructions()[instruction_match.secondary as usize]
                                .address as i64,
                        ],
                    )?;
                }
            }
        }
        transaction.commit()?;
        Ok(())
    }
}

/// Reads a result database back into a fixed-point store.
pub struct DatabaseReader {
    connection: Connection,
}

impl DatabaseReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let connection = Connection::open_with_flags(
            path.as_ref(),
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        Ok(DatabaseReader { connection })
    }

    /// Global (similarity, confidence) stored in the metadata table.
    pub fn scores(&self) -> Result<(f64, f64)> {
        let row = self
            .connection
            .query_row(
                "SELECT similarity, confidence FROM metadata",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.ok_or_else(|| DiffError::OutOfDomain("result database has no metadata".to_string()))
    }

    /// Reconstructs the fixed-point store against the two loaded programs.
    pub fn read(&self, primary: &Program, secondary: &Program) -> Result<FixedPointStore> {
        let mut store = FixedPointStore::new();

        // Per-function instruction address -> flat index lookups, built on
        // demand while restoring instruction matches.
        let mut primary_indexes: HashMap<u32, HashMap<Address, u32>> = HashMap::new();
        let mut secondary_indexes: HashMap<u32, HashMap<Address, u32>> = HashMap::new();

        let mut functions = self.connection.prepare(
            "SELECT f.id, f.address1, f.address2, f.similarity, f.confidence, f.flags, \
             f.commentsported, a.name FROM function f \
             JOIN functionalgorithm a ON a.id = f.algorithm ORDER BY f.id",
        )?;
        let mut basic_blocks = self.connection.prepare(
            "SELECT b.id, b.address1, b.address2, a.name FROM basicblock b \
             JOIN basicblockalgorithm a ON a.id = b.algorithm \
             WHERE b.functionid = ?1 ORDER BY b.id",
        )?;
        let mut instructions = self
            .connection
            .prepare("SELECT address1, address2 FROM instruction WHERE basicblockid = ?1")?;

        let function_rows = functions.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)? as Address,
                row.get::<_, i64>(2)? as Address,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, i64>(6)? != 0,
                row.get::<_, String>(7)?,
            ))
        })?;

        for row in function_rows {
            let (
                function_id,
                primary_entry,
                secondary_entry,
                similarity,
                confidence,
                flags,
                comments_ported,
                step_name,
            ) = row?;
            let step = names::resolve(&step_name).ok_or_else(|| {
                DiffError::OutOfDomain(format!("unknown matching step '{step_name}' in results"))
            })?;
            let primary_id = primary.flow_graph_by_entry(primary_entry).ok_or_else(|| {
                DiffError::OutOfDomain(format!("no primary function at {primary_entry:#x}"))
            })?;
            let secondary_id =
                secondary.flow_graph_by_entry(secondary_entry).ok_or_else(|| {
                    DiffError::OutOfDomain(format!(
                        "no secondary function at {secondary_entry:#x}"
                    ))
                })?;
            let key = store
                .add(primary_id, secondary_id, primary_entry, secondary_entry, step)
                .ok_or_else(|| {
                    DiffError::InconsistentModel(format!(
                        "duplicate match in results at ({primary_entry:#x}, {secondary_entry:#x})"
                    ))
                })?;
            let primary_fg = primary.flow_graph(primary_id);
            let secondary_fg = secondary.flow_graph(secondary_id);
            let primary_index = primary_indexes.entry(primary_id).or_insert_with(|| {
                primary_fg
                    .all_instructions()
                    .iter()
                    .enumerate()
                    .map(|(index, instruction)| (instruction.address, index as u32))
                    .collect()
            });
            let secondary_index = secondary_indexes.entry(secondary_id).or_insert_with(|| {
                secondary_fg
                    .all_instructions()
                    .iter()
                    .enumerate()
                    .map(|(index, instruction)| (instruction.address, index as u32))
                    .collect()
            });

            let Some(fixed_point) = store.get_mut(key) else {
                continue;
            };
            fixed_point.set_similarity(similarity);
            fixed_point.set_confidence(confidence);
            fixed_point.set_flags(flags);
            fixed_point.set_comments_ported(comments_ported);

            let basic_block_rows = basic_blocks.query_map([function_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)? as Address,
                    row.get::<_, i64>(2)? as Address,
                    row.get::<_, String>(3)?,
                ))
            })?;
            for basic_block_row in basic_block_rows {
                let (basic_block_id, address1, address2, bb_step_name) = basic_block_row?;
                let bb_step = names::resolve(&bb_step_name).ok_or_else(|| {
                    DiffError::OutOfDomain(format!(
                        "unknown matching step '{bb_step_name}' in results"
                    ))
                })?;
                let primary_vertex = primary_fg.vertex_by_address(address1);
                let secondary_vertex = secondary_fg.vertex_by_address(address2);
                if primary_vertex == crate::graph::digraph::INVALID_VERTEX
                    || secondary_vertex == crate::graph::digraph::INVALID_VERTEX
                {
                    return Err(DiffError::OutOfDomain(format!(
                        "no basic block at ({address1:#x}, {address2:#x})"
                    )));
                }
                let mut matches = Vec::new();
                let instruction_rows = instructions.query_map([basic_block_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)? as Address,
                        row.get::<_, i64>(1)? as Address,
                    ))
                })?;
                for instruction_row in instruction_rows {
                    let (address1, address2) = instruction_row?;
                    let (Some(&index1), Some(&index2)) =
                        (primary_index.get(&address1), secondary_index.get(&address2))
                    else {
                        return Err(DiffError::OutOfDomain(format!(
                            "no instruction at ({address1:#x}, {address2:#x})"
                        )));
                    };
                    matches.push(InstructionMatch {
                        primary: index1,
                        secondary: index2,
                    });
                }
                fixed_point.restore_basic_block(primary_vertex, secondary_vertex, bb_step, matches);
            }
        }
        Ok(store)
    }
}

/// Temporary side database recording manual-match edits made while a
/// result is open in a UI.
pub struct ManualMatchDatabase {
    connection: Connection,
}

impl ManualMatchDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let connection = Connection::open(path.as_ref())?;
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS editlog (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL CHECK (action IN ('add', 'remove')),
                address1 INTEGER NOT NULL,
                address2 INTEGER NOT NULL
            );",
        )?;
        Ok(ManualMatchDatabase { connection })
    }

    pub fn record_add(&self, primary: Address, secondary: Address) -> Result<()> {
        self.connection.execute(
            "INSERT INTO editlog (action, address1, address2) VALUES ('add', ?1, ?2)",
            params![primary as i64, secondary as i64],
        )?;
        Ok(())
    }

    pub fn record_remove(&self, primary: Address, secondary: Address) -> Result<()> {
        self.connection.execute(
            "INSERT INTO editlog (action, address1, address2) VALUES ('remove', ?1, ?2)",
            params![primary as i64, secondary as i64],
        )?;
        Ok(())
    }

    /// Replays the edit log: the manual matches still in effect, in edit
    /// order.
    pub fn pending(&self) -> Result<Vec<(Address, Address)>> {
        let mut statement = self
            .connection
            .prepare("SELECT action, address1, address2 FROM editlog ORDER BY sequence")?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? as Address,
                row.get::<_, i64>(2)? as Address,
            ))
        })?;
        let mut pending: Vec<(Address, Address)> = Vec::new();
        for row in rows {
            let (action, primary, secondary) = row?;
            match action.as_str() {
                "add" => pending.push((primary, secondary)),
                _ => pending.retain(|&(p, s)| p != primary || s != secondary),
            }
        }
        Ok(pending)
    }
}
