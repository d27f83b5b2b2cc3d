//! Vocabulary construction and token-to-feature mapping.
//!
//! Words and labels share one entry list (words first, labels last) and
//! an open-addressing hash table with linear probing. Subword character
//! n-grams and word n-grams are hashed into a fixed bucket space that is
//! offset by `nwords` when combined with word ids.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use rand::Rng;

use crate::args::Args;
use crate::binio;
use crate::corpus;
use crate::error::{Error, Result};

/// End-of-sentence marker appended to every corpus line.
pub const EOS: &str = "</s>";
const BOW: char = '<';
const EOW: char = '>';

/// Fixed hash table size during the corpus scan; rebuilt smaller on load.
const MAX_VOCAB_SIZE: usize = 10_000_000;
const MAX_LINE_SIZE: u32 = 1024;

/// 32-bit FNV-1a over Unicode scalar values, masked to 31 bits.
pub(crate) fn hash(s: &str) -> u32 {
    let mut h: u32 = 0x811C_9DC5;
    for c in s.chars() {
        h ^= c as u32;
        h = h.wrapping_mul(16_777_619);
    }
    h & 0x7fff_ffff
}

pub(crate) fn hash_chars(chars: &[char]) -> u32 {
    let mut h: u32 = 0x811C_9DC5;
    for &c in chars {
        h ^= c as u32;
        h = h.wrapping_mul(16_777_619);
    }
    h & 0x7fff_ffff
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    Word,
    Label,
}

impl EntryKind {
    fn code(self) -> i32 {
        match self {
            EntryKind::Word => 0,
            EntryKind::Label => 1,
        }
    }

    fn from_code(code: i32) -> Result<EntryKind> {
        match code {
            0 => Ok(EntryKind::Word),
            1 => Ok(EntryKind::Label),
            other => Err(Error::Configuration(format!(
                "unknown vocabulary entry kind {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Entry {
    pub word: String,
    pub count: u32,
    pub kind: EntryKind,
    /// Input-matrix indexes: the word's own id followed by its bucketed
    /// subword hashes offset by `nwords`. Computed after pruning.
    pub subwords: Vec<u32>,
}

pub struct Dictionary {
    args: Arc<Args>,
    /// Open-addressing table: slot -> entry index, -1 when empty.
    word2int: Vec<i32>,
    words: Vec<Entry>,
    /// Per-entry probability of keeping a word during subsampling.
    pdiscard: Vec<f32>,
    size: usize,
    nwords: usize,
    nlabels: usize,
    ntokens: u64,
    /// -1: never pruned. 0: all buckets dropped. >0: `pruneidx` remaps.
    pruneidx_size: i32,
    pruneidx: HashMap<u32, u32>,
}

impl Dictionary {
    fn with_table_size(args: Arc<Args>, table_size: usize) -> Dictionary {
        Dictionary {
            args,
            word2int: vec![-1; table_size],
            words: Vec::with_capacity(100_000),
            pdiscard: Vec::new(),
            size: 0,
            nwords: 0,
            nlabels: 0,
            ntokens: 0,
            pruneidx_size: -1,
            pruneidx: HashMap::new(),
        }
    }

    /// Scans a corpus, counts tokens, drops entries below the minimum
    /// counts and computes the discard and subword tables.
    pub fn build_from_file(path: &Path, args: Arc<Args>) -> Result<Dictionary> {
        info!("building dictionary from {:?}", path);
        let mut dict = Dictionary::with_table_size(args.clone(), MAX_VOCAB_SIZE);

        let reader = BufReader::new(File::open(path)?);
        let mut line_count = 0u64;
        let mut min_threshold = 1u32;
        for line in reader.lines() {
            let line = line?;
            for token in corpus::tokenize(&line) {
                if token.starts_with('#') {
                    continue;
                }
                dict.add(token);
                dict.shrink_if_crowded(&mut min_threshold);
            }
            dict.add(EOS);
            dict.shrink_if_crowded(&mut min_threshold);
            line_count += 1;
            if line_count % 1_000_000 == 0 {
                debug!("{}M lines read", line_count / 1_000_000);
            }
        }
        info!("word + label count = {}", dict.words.len());

        dict.threshold(args.min_count, args.min_count_label);
        info!(
            "word count = {}, label count = {}, tokens = {}",
            dict.nwords, dict.nlabels, dict.ntokens
        );
        dict.init_table_discard();
        dict.init_ngrams();
        Ok(dict)
    }

    fn find_slot(word2int: &[i32], words: &[Entry], w: &str, h: u32) -> usize {
        let table_size = word2int.len();
        let mut id = h as usize % table_size;
        while word2int[id] != -1 && words[word2int[id] as usize].word != w {
            id = (id + 1) % table_size;
        }
        id
    }

    fn find(&self, w: &str) -> usize {
        Self::find_slot(&self.word2int, &self.words, w, hash(w))
    }

    fn add(&mut self, w: &str) {
        let slot = self.find(w);
        self.ntokens += 1;
        if self.word2int[slot] == -1 {
            self.words.push(Entry {
                word: w.to_string(),
                count: 1,
                kind: self.kind_of(w),
                subwords: Vec::new(),
            });
            self.word2int[slot] = self.size as i32;
            self.size += 1;
        } else {
            self.words[self.word2int[slot] as usize].count += 1;
        }
    }

    fn kind_of(&self, w: &str) -> EntryKind {
        if w.starts_with(&self.args.label_prefix) {
            EntryKind::Label
        } else {
            EntryKind::Word
        }
    }

    /// Raises the count floor and purges the vocabulary once the scan
    /// table passes a 75% load factor. `add` requires a free slot, and
    /// probe chains grow long well before the table fills.
    fn shrink_if_crowded(&mut self, min_threshold: &mut u32) -> bool {
        if self.size * 4 <= self.word2int.len() * 3 {
            return false;
        }
        *min_threshold += 1;
        info!("scan table is 75% full, raising the count floor to {min_threshold}");
        self.threshold(*min_threshold, *min_threshold);
        true
    }

    /// Sorts entries (words before labels, descending count), drops
    /// entries below the minimum count and rebuilds the hash table.
    fn threshold(&mut self, min_count: u32, min_count_label: u32) {
        self.words
            .sort_by(|a, b| a.kind.cmp(&b.kind).then(b.count.cmp(&a.count)));
        self.words.retain(|e| match e.kind {
            EntryKind::Word => e.count >= min_count,
            EntryKind::Label => e.count >= min_count_label,
        });
        self.size = 0;
        self.nwords = 0;
        self.nlabels = 0;
        self.word2int.fill(-1);
        for i in 0..self.words.len() {
            let h = hash(&self.words[i].word);
            let slot = Self::find_slot(&self.word2int, &self.words, &self.words[i].word, h);
            self.word2int[slot] = self.size as i32;
            self.size += 1;
            match self.words[i].kind {
                EntryKind::Word => self.nwords += 1,
                EntryKind::Label => self.nlabels += 1,
            }
        }
    }

    fn init_table_discard(&mut self) {
        let t = self.args.t;
        self.pdiscard = self
            .words
            .iter()
            .map(|e| {
                let f = e.count as f64 / self.ntokens as f64;
                ((t / f).sqrt() + t / f) as f32
            })
            .collect();
    }

    fn init_ngrams(&mut self) {
        for i in 0..self.size {
            if self.words[i].word == EOS {
                self.words[i].subwords = Vec::new();
                continue;
            }
            let wrapped = format!("{BOW}{}{EOW}", self.words[i].word);
            let subwords = self.compute_subwords(&wrapped, Some(i));
            self.words[i].subwords = subwords;
        }
    }

    /// Subword ids for a `<word>`-wrapped token: the word's own id when
    /// known, then its bucketed n-gram hashes offset by `nwords`.
    fn compute_subwords(&self, wrapped: &str, word_id: Option<usize>) -> Vec<u32> {
        let mut ids = Vec::new();
        if let Some(id) = word_id {
            ids.push(id as u32);
        }
        for h in self.args.subwords.hashes(wrapped) {
            self.push_hash(&mut ids, h % self.args.bucket as u32);
        }
        ids
    }

    /// Applies the prune remapping (when present) and offsets a bucket
    /// id into the shared embedding index space.
    fn push_hash(&self, ids: &mut Vec<u32>, bucket_id: u32) {
        if self.pruneidx_size == 0 {
            return;
        }
        let mut id = bucket_id;
        if self.pruneidx_size > 0 {
            match self.pruneidx.get(&bucket_id) {
                Some(&mapped) => id = mapped,
                None => return,
            }
        }
        ids.push(self.nwords as u32 + id);
    }

    pub fn nwords(&self) -> usize {
        self.nwords
    }

    pub fn nlabels(&self) -> usize {
        self.nlabels
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ntokens(&self) -> u64 {
        self.ntokens
    }

    pub fn word(&self, id: usize) -> &str {
        &self.words[id].word
    }

    pub fn kind(&self, id: usize) -> EntryKind {
        self.words[id].kind
    }

    pub fn get_id(&self, w: &str) -> i32 {
        self.get_id_with_hash(w, hash(w))
    }

    fn get_id_with_hash(&self, w: &str, h: u32) -> i32 {
        let slot = Self::find_slot(&self.word2int, &self.words, w, h);
        self.word2int[slot]
    }

    pub fn get_subwords(&self, id: usize) -> &[u32] {
        debug_assert!(id < self.nwords);
        &self.words[id].subwords
    }

    /// Subword ids for an arbitrary word, in or out of vocabulary.
    pub fn subwords_of(&self, word: &str) -> Vec<u32> {
        let id = self.get_id(word);
        if id >= 0 {
            return self.words[id as usize].subwords.clone();
        }
        if word != EOS {
            self.compute_subwords(&format!("{BOW}{word}{EOW}"), None)
        } else {
            Vec::new()
        }
    }

    fn discard(&self, id: usize, rand: f32) -> bool {
        debug_assert!(id < self.nwords);
        rand > self.pdiscard[id]
    }

    pub fn labels(&self) -> Vec<String> {
        self.words
            .iter()
            .filter(|e| e.kind == EntryKind::Label)
            .map(|e| e.word.clone())
            .collect()
    }

    pub fn label(&self, lid: usize) -> Result<&str> {
        if lid >= self.nlabels {
            return Err(Error::Argument(format!(
                "label id {lid} is out of range [0, {})",
                self.nlabels
            )));
        }
        Ok(&self.words[self.nwords + lid].word)
    }

    /// Per-class occurrence counts, in entry order.
    pub fn counts(&self, kind: EntryKind) -> Vec<u32> {
        self.words
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.count)
            .collect()
    }

    /// Maps a line to in-vocabulary word ids, probabilistically dropping
    /// frequent words. Returns the number of known tokens seen.
    pub fn line_to_word_ids<R: Rng>(
        &self,
        line: &str,
        words: &mut Vec<u32>,
        rng: &mut R,
    ) -> u32 {
        let mut ntokens = 0u32;
        for token in corpus::tokenize(line) {
            if token.starts_with('#') {
                continue;
            }
            let wid = self.get_id_with_hash(token, hash(token));
            if wid < 0 {
                continue;
            }
            ntokens += 1;
            let wid = wid as usize;
            if self.kind(wid) == EntryKind::Word && !self.discard(wid, rng.gen::<f32>()) {
                words.push(wid as u32);
            }
            if ntokens > MAX_LINE_SIZE || token == EOS {
                break;
            }
        }
        ntokens
    }

    fn add_subwords(&self, line: &mut Vec<u32>, token: &str, wid: i32) {
        if wid < 0 {
            // Out of vocabulary: only subword hashes can represent it.
            if token != EOS && self.args.subwords.max_n() > 0 {
                let subwords = self.compute_subwords(&format!("{BOW}{token}{EOW}"), None);
                line.extend(subwords);
            }
        } else if self.args.subwords.max_n() == 0 {
            line.push(wid as u32);
        } else {
            line.extend_from_slice(self.get_subwords(wid as usize));
        }
    }

    /// Maps a labeled line to word features and label ids. Word n-gram
    /// hashes of order `2..=word_ngrams` are appended to the features.
    pub fn line_to_features(
        &self,
        line: &str,
        words: &mut Vec<u32>,
        labels: &mut Vec<u32>,
    ) -> u32 {
        let mut word_hashes = Vec::new();
        let mut ntokens = 0u32;
        for token in corpus::tokenize(line) {
            if token.starts_with('#') {
                continue;
            }
            let h = hash(token);
            let wid = self.get_id_with_hash(token, h);
            let kind = if wid < 0 {
                self.kind_of(token)
            } else {
                self.kind(wid as usize)
            };
            ntokens += 1;
            match kind {
                EntryKind::Word => {
                    self.add_subwords(words, token, wid);
                    word_hashes.push(h);
                }
                EntryKind::Label => {
                    if wid >= 0 {
                        labels.push((wid as usize - self.nwords) as u32);
                    }
                }
            }
            if token == EOS {
                break;
            }
        }
        self.add_word_ngram_hashes(words, &word_hashes, self.args.word_ngrams);
        ntokens
    }

    /// Combines consecutive token hashes into word n-gram bucket ids:
    /// `h = h * 116049371 + next`, reduced modulo the bucket count.
    pub(crate) fn add_word_ngram_hashes(
        &self,
        line: &mut Vec<u32>,
        hashes: &[u32],
        n: usize,
    ) {
        for i in 0..hashes.len() {
            let mut h = hashes[i] as u64;
            for j in i + 1..hashes.len().min(i + n) {
                h = h.wrapping_mul(116_049_371).wrapping_add(hashes[j] as u64);
                self.push_hash(line, (h % self.args.bucket as u64) as u32);
            }
        }
    }

    /// Variant used for vector extraction: the line's own ids are the
    /// hash inputs.
    pub(crate) fn add_line_ngram_hashes(&self, line: &mut Vec<u32>, n: usize) {
        let line_size = line.len();
        for i in 0..line_size {
            let mut h = line[i] as u64;
            for j in i + 1..line_size.min(i + n) {
                h = h.wrapping_mul(116_049_371).wrapping_add(line[j] as u64);
                self.push_hash(line, (h % self.args.bucket as u64) as u32);
            }
        }
    }

    /// Restricts the dictionary to the given input-matrix indexes: kept
    /// word ids are compacted to a dense prefix, kept bucket ids get a
    /// sparse remapping, labels survive untouched. Returns the retained
    /// old indexes in their new row order.
    pub fn prune(&mut self, idx: &[u32]) -> Vec<u32> {
        let mut kept_words: Vec<u32> = idx
            .iter()
            .copied()
            .filter(|&i| (i as usize) < self.nwords)
            .collect();
        let ngrams: Vec<u32> = idx
            .iter()
            .copied()
            .filter(|&i| (i as usize) >= self.nwords)
            .collect();
        kept_words.sort_unstable();

        let mut new_indexes = kept_words.clone();
        if !ngrams.is_empty() {
            for (j, &ngram) in ngrams.iter().enumerate() {
                self.pruneidx
                    .insert(ngram - self.nwords as u32, j as u32);
            }
            new_indexes.extend_from_slice(&ngrams);
        }
        self.pruneidx_size = self.pruneidx.len() as i32;

        self.word2int.fill(-1);
        let mut j = 0usize;
        for i in 0..self.words.len() {
            let keep = self.words[i].kind == EntryKind::Label
                || (j < kept_words.len() && kept_words[j] == i as u32);
            if keep {
                if i != j {
                    self.words.swap(j, i);
                }
                let h = hash(&self.words[j].word);
                let slot =
                    Self::find_slot(&self.word2int, &self.words, &self.words[j].word, h);
                self.word2int[slot] = j as i32;
                j += 1;
            }
        }
        self.nwords = kept_words.len();
        self.size = self.nwords + self.nlabels;
        self.words.truncate(self.size);
        self.init_ngrams();
        new_indexes
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        binio::write_i32(w, self.size as i32)?;
        binio::write_i32(w, self.nwords as i32)?;
        binio::write_i32(w, self.nlabels as i32)?;
        binio::write_i64(w, self.ntokens as i64)?;
        binio::write_i32(w, self.pruneidx_size)?;
        for e in &self.words {
            binio::write_str(w, &e.word)?;
            binio::write_i32(w, e.count as i32)?;
            binio::write_i32(w, e.kind.code())?;
        }
        for (&key, &value) in &self.pruneidx {
            binio::write_i32(w, key as i32)?;
            binio::write_i32(w, value as i32)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, args: Arc<Args>) -> Result<Dictionary> {
        let size = binio::read_i32(r)?;
        let nwords = binio::read_i32(r)?;
        let nlabels = binio::read_i32(r)?;
        if size < 0 || nwords < 0 || nlabels < 0 || nwords as i64 + nlabels as i64 != size as i64 {
            return Err(Error::Configuration(format!(
                "inconsistent vocabulary header: size {size}, words {nwords}, labels {nlabels}"
            )));
        }
        let size = size as usize;
        let nwords = nwords as usize;
        let nlabels = nlabels as usize;
        let ntokens = binio::read_i64(r)? as u64;
        let pruneidx_size = binio::read_i32(r)?;

        // Rebuild the table at a 1/0.7 load factor.
        let table_size = (size as f64 / 0.7).ceil() as usize;
        let mut dict = Dictionary::with_table_size(args, table_size.max(1));
        dict.size = size;
        dict.nwords = nwords;
        dict.nlabels = nlabels;
        dict.ntokens = ntokens;
        dict.pruneidx_size = pruneidx_size;

        for i in 0..size {
            let word = binio::read_str(r)?;
            let count = binio::read_i32(r)? as u32;
            let kind = EntryKind::from_code(binio::read_i32(r)?)?;
            // label() and prune() rely on the words-then-labels layout.
            let expected = if i < nwords {
                EntryKind::Word
            } else {
                EntryKind::Label
            };
            if kind != expected {
                return Err(Error::Configuration(format!(
                    "vocabulary entry {i} has kind {kind:?}, expected {expected:?}"
                )));
            }
            dict.words.push(Entry {
                word,
                count,
                kind,
                subwords: Vec::new(),
            });
        }
        for _ in 0..pruneidx_size.max(0) {
            let key = binio::read_i32(r)? as u32;
            let value = binio::read_i32(r)? as u32;
            dict.pruneidx.insert(key, value);
        }

        for i in 0..dict.words.len() {
            let h = hash(&dict.words[i].word);
            let slot = Self::find_slot(&dict.word2int, &dict.words, &dict.words[i].word, h);
            dict.word2int[slot] = i as i32;
        }
        dict.init_table_discard();
        dict.init_ngrams();
        Ok(dict)
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> &[Entry] {
        &self.words
    }
}
