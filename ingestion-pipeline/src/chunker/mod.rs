//! C3 SmartChunker: greedily merges small semantic blocks into
//! near-`chunk_tokens`-sized chunks with sentence-level overlap, while
//! routing lists, tables, and oversized blocks to their own splitters.

use serde_json::{Map, Value};

use common::utils::config::AppConfig;

use crate::tokenizer::TokenCounter;

/// One semantic block coming out of the parser/hierarchy-enrichment stage:
/// a span of text plus whatever metadata (`type`, `context_path`, heading
/// titles, ...) was attached to it upstream.
#[derive(Debug, Clone)]
pub struct Section {
    pub text: String,
    pub meta: Map<String, Value>,
}

impl Section {
    fn section_type(&self) -> &str {
        self.meta.get("type").and_then(Value::as_str).unwrap_or("paragraph")
    }
}

/// A chunk before it is keyed onto a `doc_id`/`chunk_id` pair and written
/// to storage.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub text: String,
    pub meta: Map<String, Value>,
    pub block_type: String,
}

pub struct SmartChunker {
    chunk_tokens: usize,
    overlap_tokens: usize,
    section_limit: usize,
    doc_limit: usize,
    list_limit: usize,
    table_limit: usize,
    table_row_group_tokens: Option<usize>,
    table_row_overlap: Option<usize>,
    counter: TokenCounter,
}

impl SmartChunker {
    #[must_use]
    pub fn new(config: &AppConfig, counter: TokenCounter) -> Self {
        Self {
            chunk_tokens: config.chunker_chunk_tokens,
            overlap_tokens: config.chunker_overlap_tokens,
            section_limit: config.chunker_section_limit,
            doc_limit: config.chunker_doc_limit,
            list_limit: config.chunker_list_limit,
            table_limit: config.chunker_table_limit,
            table_row_group_tokens: config.chunker_table_row_group_tokens,
            table_row_overlap: config.chunker_table_row_overlap,
            counter,
        }
    }

    #[must_use]
    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count_tokens(text)
    }

    /// Builds the metadata for a merged chunk: one entry per source section,
    /// indexed and ordered, plus a flattened `section_{index}.{key}` lookup
    /// that never lets a later section's key overwrite an earlier one's.
    fn build_combined_meta(&self, sections: &[(usize, Section)], is_whole_doc: bool) -> Map<String, Value> {
        let mut combined = Map::new();
        let mut section_entries = Vec::new();
        let mut flattened = Map::new();

        for (idx, sec) in sections {
            let mut entry = Map::new();
            entry.insert("index".to_string(), Value::from(*idx));
            for (key, value) in &sec.meta {
                entry.insert(key.clone(), value.clone());
                flattened
                    .entry(format!("section_{idx}.{key}"))
                    .or_insert_with(|| value.clone());
            }
            section_entries.push(Value::Object(entry));
        }

        combined.insert("sections".to_string(), Value::Array(section_entries));
        for (key, value) in flattened {
            combined.insert(key, value);
        }
        if is_whole_doc {
            combined.insert("is_whole_doc".to_string(), Value::Bool(true));
        }
        combined
    }

    /// Splits one oversized block (> `section_limit`) on sentence
    /// boundaries, packing sentences into `chunk_tokens`-sized pieces with a
    /// trailing-sentence overlap carried into the next piece.
    fn split_large_text_block(&self, text: &str, meta: &Map<String, Value>) -> Vec<RawChunk> {
        if text.is_empty() {
            return Vec::new();
        }

        let sentences = split_to_sentences(text);
        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0usize;

        for sentence in &sentences {
            let sentence_tokens = self.counter.count_tokens(sentence);

            if !current.is_empty() && current_tokens + sentence_tokens > self.chunk_tokens {
                chunks.push(RawChunk {
                    text: current.join(" "),
                    meta: meta.clone(),
                    block_type: "section_part".to_string(),
                });

                let mut overlap = Vec::new();
                let mut overlap_tokens = 0usize;
                for s in current.iter().rev() {
                    let tokens = self.counter.count_tokens(s);
                    if overlap_tokens + tokens > self.overlap_tokens {
                        break;
                    }
                    overlap.insert(0, *s);
                    overlap_tokens += tokens;
                }
                current = overlap;
                current_tokens = overlap_tokens;
            }

            current.push(sentence);
            current_tokens += sentence_tokens;
        }

        if !current.is_empty() {
            chunks.push(RawChunk {
                text: current.join(" "),
                meta: meta.clone(),
                block_type: "section_part".to_string(),
            });
        }

        chunks
    }

    fn build_overlap_lines<'a>(&self, lines: &[&'a str], max_tokens: usize) -> Vec<&'a str> {
        let mut overlap = Vec::new();
        let mut accumulated = 0usize;
        for line in lines.iter().rev() {
            let tokens = self.counter.count_tokens(line);
            if !overlap.is_empty() && accumulated + tokens > max_tokens {
                break;
            }
            overlap.insert(0, *line);
            accumulated += tokens;
            if accumulated >= max_tokens {
                break;
            }
        }
        overlap
    }

    /// Lists under `list_limit` pass through whole; longer ones are cut on
    /// line boundaries into `chunk_tokens`-sized parts with a line overlap.
    fn handle_list(&self, text: &str, meta: &Map<String, Value>) -> Vec<RawChunk> {
        if self.counter.count_tokens(text) <= self.list_limit {
            return vec![RawChunk {
                text: text.to_string(),
                meta: meta.clone(),
                block_type: "list".to_string(),
            }];
        }

        let items: Vec<&str> = text.split('\n').collect();
        let mut block: Vec<&str> = Vec::new();
        let mut result = Vec::new();
        let mut current_tokens = 0usize;

        for item in items {
            let item_tokens = self.counter.count_tokens(item);
            if !block.is_empty() && current_tokens + item_tokens > self.chunk_tokens {
                result.push(RawChunk {
                    text: block.join("\n"),
                    meta: meta.clone(),
                    block_type: "list_part".to_string(),
                });

                let overlap = if self.overlap_tokens > 0 {
                    self.build_overlap_lines(&block, self.overlap_tokens)
                } else {
                    Vec::new()
                };
                current_tokens = overlap.iter().map(|l| self.counter.count_tokens(l)).sum();
                block = overlap;
            }

            block.push(item);
            current_tokens += item_tokens;
        }

        if !block.is_empty() {
            result.push(RawChunk {
                text: block.join("\n"),
                meta: meta.clone(),
                block_type: "list_part".to_string(),
            });
        }

        result
    }

    /// Markdown tables under `table_limit` pass through whole; longer ones
    /// are cut on row boundaries, repeating the header and separator row in
    /// every part so each part stays independently readable.
    fn handle_table(&self, text: &str, meta: &Map<String, Value>) -> Vec<RawChunk> {
        let mut meta = meta.clone();
        let section_id = stable_table_section_id(&meta, text);
        meta.insert("section".to_string(), Value::String(section_id));

        if self.counter.count_tokens(text) <= self.table_limit {
            return vec![RawChunk {
                text: text.to_string(),
                meta,
                block_type: "table".to_string(),
            }];
        }

        let rows: Vec<&str> = text.split('\n').collect();
        if rows.len() < 2 {
            return self.split_large_text_block(text, &meta);
        }

        let header = rows[0];
        let separator = rows[1];
        let data_rows = &rows[2..];
        let header_tokens = self.counter.count_tokens(header) + self.counter.count_tokens(separator);
        let effective_group_limit = self
            .table_row_group_tokens
            .unwrap_or(self.chunk_tokens.saturating_sub(header_tokens))
            .min(self.chunk_tokens.saturating_sub(header_tokens));

        let mut result = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0usize;

        for row in data_rows {
            let row_tokens = self.counter.count_tokens(row);
            if !current.is_empty() && current_tokens + row_tokens > effective_group_limit {
                let mut block = vec![header, separator];
                block.extend(current.iter().copied());
                result.push(RawChunk {
                    text: block.join("\n"),
                    meta: meta.clone(),
                    block_type: "table_part".to_string(),
                });

                let overlap = if let Some(n) = self.table_row_overlap {
                    current.iter().rev().take(n).rev().copied().collect()
                } else if self.overlap_tokens > 0 {
                    self.build_overlap_lines(&current, self.overlap_tokens)
                } else {
                    Vec::new()
                };
                current_tokens = overlap.iter().map(|r| self.counter.count_tokens(r)).sum();
                current = overlap;
            }

            current.push(row);
            current_tokens += row_tokens;
        }

        if !current.is_empty() {
            let mut block = vec![header, separator];
            block.extend(current.iter().copied());
            result.push(RawChunk {
                text: block.join("\n"),
                meta,
                block_type: "table_part".to_string(),
            });
        }

        result
    }

    /// Carries forward the trailing sections of a flushed composite buffer
    /// so the next chunk opens with up to `overlap_tokens` of shared
    /// context, mirroring the sentence/row/line overlap builders above.
    fn build_section_overlap(&self, buffer: &[(usize, Section)]) -> Vec<(usize, Section)> {
        let mut overlap = Vec::new();
        let mut accumulated = 0usize;
        for (idx, sec) in buffer.iter().rev() {
            let tokens = self.counter.count_tokens(&sec.text);
            if !overlap.is_empty() && accumulated + tokens > self.overlap_tokens {
                break;
            }
            overlap.insert(0, (*idx, sec.clone()));
            accumulated += tokens;
            if accumulated >= self.overlap_tokens {
                break;
            }
        }
        overlap
    }

    /// Main entry point. If the whole document fits under `doc_limit`
    /// tokens it is returned as a single chunk to maximize context;
    /// otherwise sections are greedily merged into composite chunks with
    /// overlap, lists/tables route to their own handlers, and any section
    /// over `section_limit` is split on sentence boundaries on its own.
    #[must_use]
    pub fn split_document(&self, sections: &[Section]) -> Vec<RawChunk> {
        let total_text = sections
            .iter()
            .filter(|s| !s.text.is_empty())
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        if self.counter.count_tokens(&total_text) <= self.doc_limit {
            let entries: Vec<(usize, Section)> = sections
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.text.is_empty())
                .map(|(idx, s)| (idx, s.clone()))
                .collect();
            let combined_meta = self.build_combined_meta(&entries, true);
            return vec![RawChunk {
                text: total_text,
                meta: combined_meta,
                block_type: "doc".to_string(),
            }];
        }

        let mut chunks = Vec::new();
        let mut buffer: Vec<(usize, Section)> = Vec::new();

        for (idx, sec) in sections.iter().enumerate() {
            let sec_text = sec.text.trim();
            if sec_text.is_empty() {
                continue;
            }

            let sec_type = sec.section_type().to_string();
            let is_table = sec_type == "table" || sec_type == "table_rows_group";
            if sec_type == "list" || sec_type == "list_item" || is_table {
                if !buffer.is_empty() {
                    let chunk_text = buffer.iter().map(|(_, s)| s.text.as_str()).collect::<Vec<_>>().join("\n\n");
                    let combined_meta = self.build_combined_meta(&buffer, false);
                    chunks.push(RawChunk {
                        text: chunk_text,
                        meta: combined_meta,
                        block_type: "composite_section".to_string(),
                    });
                    buffer.clear();
                }
                if is_table {
                    chunks.extend(self.handle_table(sec_text, &sec.meta));
                } else {
                    chunks.extend(self.handle_list(sec_text, &sec.meta));
                }
                continue;
            }

            let sec_tokens = self.counter.count_tokens(sec_text);

            if sec_tokens > self.section_limit {
                if !buffer.is_empty() {
                    let chunk_text = buffer.iter().map(|(_, s)| s.text.as_str()).collect::<Vec<_>>().join("\n\n");
                    let combined_meta = self.build_combined_meta(&buffer, false);
                    chunks.push(RawChunk {
                        text: chunk_text,
                        meta: combined_meta,
                        block_type: "composite_section".to_string(),
                    });
                    buffer.clear();
                }
                chunks.extend(self.split_large_text_block(sec_text, &sec.meta));
                continue;
            }

            let buffer_tokens = self.counter.count_tokens(
                &buffer.iter().map(|(_, s)| s.text.as_str()).collect::<Vec<_>>().join("\n\n"),
            );
            if buffer_tokens > 0 && buffer_tokens + sec_tokens > self.chunk_tokens {
                let chunk_text = buffer.iter().map(|(_, s)| s.text.as_str()).collect::<Vec<_>>().join("\n\n");
                let combined_meta = self.build_combined_meta(&buffer, false);
                chunks.push(RawChunk {
                    text: chunk_text,
                    meta: combined_meta,
                    block_type: "composite_section".to_string(),
                });

                buffer = if self.overlap_tokens > 0 {
                    self.build_section_overlap(&buffer)
                } else {
                    Vec::new()
                };
            }

            buffer.push((idx, Section { text: sec_text.to_string(), meta: sec.meta.clone() }));
        }

        if !buffer.is_empty() {
            let chunk_text = buffer.iter().map(|(_, s)| s.text.as_str()).collect::<Vec<_>>().join("\n\n");
            let combined_meta = self.build_combined_meta(&buffer, false);
            chunks.push(RawChunk {
                text: chunk_text,
                meta: combined_meta,
                block_type: "composite_section".to_string(),
            });
        }

        chunks
    }
}

/// Stable section identifier for a table, stored on every chunk split out
/// of it so row-group parts can be traced back to the same source table:
/// prefers an existing `section`/`table_id`/`caption` key, falling back to
/// a short hash of the table text.
fn stable_table_section_id(meta: &Map<String, Value>, text: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    for key in ["section", "table_id", "caption"] {
        if let Some(value) = meta.get(key).and_then(Value::as_str) {
            return value.to_string();
        }
    }

    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("table_{:x}", hasher.finish())
}

/// Splits on `.`/`!`/`?` followed by whitespace or end of text. Deliberately
/// simple: good enough to keep sentence packing from cutting mid-word, not
/// a full NLP sentence boundary detector.
fn split_to_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut start = 0usize;

    for i in 0..chars.len() {
        let (idx, c) = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars
                .get(i + 1)
                .map_or(true, |&(_, next)| next.is_whitespace());
            if at_boundary {
                let end = idx + c.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = end;
            }
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(chunk_tokens: usize, overlap_tokens: usize, section_limit: usize, doc_limit: usize) -> SmartChunker {
        SmartChunker {
            chunk_tokens,
            overlap_tokens,
            section_limit,
            doc_limit,
            list_limit: section_limit,
            table_limit: section_limit,
            table_row_group_tokens: None,
            table_row_overlap: None,
            counter: TokenCounter::whitespace_only(),
        }
    }

    fn table_chunker(
        chunk_tokens: usize,
        table_row_group_tokens: usize,
        table_row_overlap: usize,
    ) -> SmartChunker {
        SmartChunker {
            chunk_tokens,
            overlap_tokens: 0,
            section_limit: chunk_tokens,
            doc_limit: 0,
            list_limit: chunk_tokens,
            table_limit: 0,
            table_row_group_tokens: Some(table_row_group_tokens),
            table_row_overlap: Some(table_row_overlap),
            counter: TokenCounter::whitespace_only(),
        }
    }

    fn section(text: &str, kind: &str) -> Section {
        let mut meta = Map::new();
        meta.insert("type".to_string(), Value::String(kind.to_string()));
        Section { text: text.to_string(), meta }
    }

    #[test]
    fn short_document_returns_single_whole_doc_chunk() {
        let c = chunker(500, 50, 2000, 3000);
        let sections = vec![section("first paragraph", "paragraph"), section("second paragraph", "paragraph")];
        let chunks = c.split_document(&sections);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].block_type, "doc");
        assert_eq!(chunks[0].meta.get("is_whole_doc"), Some(&Value::Bool(true)));
    }

    #[test]
    fn split_to_sentences_keeps_punctuation_attached() {
        let sentences = split_to_sentences("Hello world. How are you? Fine!");
        assert_eq!(sentences, vec!["Hello world.", "How are you?", "Fine!"]);
    }

    #[test]
    fn table_over_limit_splits_and_repeats_header() {
        let c = chunker(20, 0, 2000, 3000);
        let table_text = "| a | b |\n|---|---|\n| 1 | 2 |\n| 3 | 4 |\n| 5 | 6 |\n| 7 | 8 |";
        let meta = Map::new();
        let parts = c.handle_table(table_text, &meta);
        assert!(parts.len() > 1);
        for part in &parts {
            assert!(part.text.starts_with("| a | b |"));
            assert_eq!(part.block_type, "table_part");
        }
    }

    #[test]
    fn paragraph_and_implicit_list_split_into_three_chunks() {
        let c = chunker(12, 0, 100, 0);
        let list_text = [
            "Первый пункт списка без маркера",
            "Второй пункт списка без маркера",
            "Третий пункт списка без маркера.",
        ]
        .join("\n");
        let sections = vec![
            section("Вступительный абзац короткий.", "paragraph"),
            section(&list_text, "list"),
            section("Заключительный абзац с выводами.", "paragraph"),
        ];
        let chunks = c.split_document(&sections);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.starts_with("Вступительный абзац"));
        for line in ["Первый пункт", "Второй пункт", "Третий пункт"] {
            assert!(chunks[1].text.contains(line), "missing {line:?} in {:?}", chunks[1].text);
        }
        assert!(chunks[2].text.starts_with("Заключительный абзац"));
    }

    #[test]
    fn table_row_grouping_overlaps_one_row_between_chunks() {
        let c = table_chunker(20, 12, 1);
        let table_text = "| a | b |\n|---|---|\n| r1 | c1 |\n| r2 | c2 |\n| r3 | c3 |\n| r4 | c4 |";
        let meta = Map::new();
        let parts = c.handle_table(table_text, &meta);
        assert_eq!(parts.len(), 3);
        for part in &parts {
            assert!(part.text.starts_with("| a | b |\n|---|---|"));
        }
        assert!(parts[0].text.contains("| r2 | c2 |"));
        assert!(parts[1].text.contains("| r2 | c2 |"));
    }

    #[test]
    fn composite_section_overlap_carries_first_paragraph_into_second_chunk() {
        let c = chunker(5, 2, 100, 0);
        let sections = vec![section("Alpha bravo", "paragraph"), section("Charlie delta echo foxtrot", "paragraph")];
        let chunks = c.split_document(&sections);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Alpha bravo");
        assert!(chunks[1].text.contains("Alpha bravo"));
    }

    #[test]
    fn composite_section_never_overwrites_colliding_section_keys() {
        let c = chunker(100, 0, 2000, 1);
        let mut meta_a = Map::new();
        meta_a.insert("title".to_string(), Value::String("A".to_string()));
        let mut meta_b = Map::new();
        meta_b.insert("title".to_string(), Value::String("B".to_string()));
        let sections = vec![
            Section { text: "alpha".to_string(), meta: meta_a },
            Section { text: "beta".to_string(), meta: meta_b },
        ];
        let chunks = c.split_document(&sections);
        let chunk = chunks.into_iter().find(|c| c.block_type == "composite_section").expect("composite chunk");
        assert_eq!(chunk.meta.get("section_0.title"), Some(&Value::String("A".to_string())));
        assert_eq!(chunk.meta.get("section_1.title"), Some(&Value::String("B".to_string())));
    }
}
