use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;
/// Headers longer than this are treated as corrupt
const MAX_HEADER_BLOCKS: usize = 64;

/// Primary header of a FITS file, in card order
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FitsHeader {
    cards: Vec<(String, String)>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    /// Bytes occupied by the header blocks
    #[serde(skip)]
    header_len: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ImageInfo {
    pub width: usize,
    pub height: usize,
    pub bit_depth: i32,
    pub dimensions: Vec<usize>,
}

impl FitsHeader {
    pub fn from_cards<I, K, V>(cards: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut header = FitsHeader::default();
        for (key, value) in cards {
            header.push(key.into(), value.into());
        }
        header
    }

    fn push(&mut self, key: String, value: String) {
        // Repeated keywords keep their first value
        if !self.index.contains_key(&key) {
            self.index.insert(key.clone(), self.cards.len());
        }
        self.cards.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&i| self.cards[i].1.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cards.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|s| s.parse::<i64>().ok())
    }

    pub fn image_info(&self) -> Option<ImageInfo> {
        let naxis = self.get_int("NAXIS")?;
        if naxis < 2 {
            return None;
        }
        let dimensions: Vec<usize> = (1..=naxis)
            .filter_map(|i| self.get_int(&format!("NAXIS{}", i)))
            .map(|d| d.max(0) as usize)
            .collect();
        if dimensions.len() < 2 {
            return None;
        }
        Some(ImageInfo {
            width: dimensions[0],
            height: dimensions[1],
            bit_depth: self.get_int("BITPIX").unwrap_or(0) as i32,
            dimensions,
        })
    }

    /// Size in bytes of the primary data unit, without padding
    pub fn data_len(&self) -> usize {
        let naxis = self.get_int("NAXIS").unwrap_or(0);
        if naxis <= 0 {
            return 0;
        }
        let bytes_per_value = (self.get_int("BITPIX").unwrap_or(0).unsigned_abs() / 8) as usize;
        (1..=naxis)
            .map(|i| self.get_int(&format!("NAXIS{}", i)).unwrap_or(0).max(0) as usize)
            .product::<usize>()
            * bytes_per_value
    }
}

/// Read and validate the primary header of a FITS file.
///
/// Fails when the file does not start with `SIMPLE`, has no `END` card, or is too
/// short to hold the data unit the header announces.
pub fn read_header(path: &Path) -> Result<FitsHeader> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open FITS file: {}", path.display()))?;
    let file_len = file
        .metadata()
        .with_context(|| format!("Failed to stat FITS file: {}", path.display()))?
        .len() as usize;

    let mut header_data = Vec::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        file.read_exact(&mut block)
            .with_context(|| format!("Truncated FITS header in {}", path.display()))?;
        header_data.extend_from_slice(&block);
        if block_has_end(&block) {
            break;
        }
        if header_data.len() >= MAX_HEADER_BLOCKS * BLOCK_SIZE {
            bail!("No END card found in FITS header of {}", path.display());
        }
    }

    let header = parse_header(&header_data)
        .with_context(|| format!("Invalid FITS header in {}", path.display()))?;

    let needed = header.header_len + header.data_len();
    if file_len < needed {
        bail!(
            "FITS file {} is truncated: header announces {} bytes, file has {}",
            path.display(),
            needed,
            file_len
        );
    }

    Ok(header)
}

fn block_has_end(block: &[u8]) -> bool {
    block
        .chunks(CARD_SIZE)
        .any(|card| card.starts_with(b"END") && card[3..].iter().all(|&b| b == b' '))
}

/// Parse header blocks into cards
pub fn parse_header(data: &[u8]) -> Result<FitsHeader> {
    let mut header = FitsHeader::default();
    let mut found_end = false;

    for (i, chunk) in data.chunks(CARD_SIZE).enumerate() {
        // Non-ASCII bytes, e.g. Latin-1 comments, decode lossily
        let decoded = String::from_utf8_lossy(chunk);
        let card: &str = &decoded;

        if i == 0 && !card.starts_with("SIMPLE") {
            bail!("Not a FITS file: first card is not SIMPLE");
        }

        let keyword = card.get(..8).unwrap_or(card).trim();
        if keyword == "END" {
            found_end = true;
            header.header_len = ((i * CARD_SIZE) / BLOCK_SIZE + 1) * BLOCK_SIZE;
            break;
        }

        if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
            continue;
        }

        // Value indicator in columns 9-10
        if card.get(8..10) != Some("= ") {
            continue;
        }
        let value = parse_card_value(&card[10..]);
        header.push(keyword.to_string(), value);
    }

    if !found_end {
        bail!("No END card found in FITS header");
    }

    Ok(header)
}

/// Value portion of a card: quoted strings honor doubled quotes and may contain `/`
fn parse_card_value(field: &str) -> String {
    let trimmed = field.trim_start();
    if let Some(rest) = trimmed.strip_prefix('\'') {
        let mut value = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    value.push('\'');
                    chars.next();
                } else {
                    break;
                }
            } else {
                value.push(c);
            }
        }
        return value.trim_end().to_string();
    }

    match trimmed.find('/') {
        Some(comment_pos) => trimmed[..comment_pos].trim().to_string(),
        None => trimmed.trim().to_string(),
    }
}

/// Format a header for display
pub fn format_header(filename: &str, header: &FitsHeader, verbose: bool) -> String {
    let mut output = String::new();

    output.push_str(&format!("FITS File: {}\n", filename));

    if let Some(ref img_info) = header.image_info() {
        output.push_str("\nImage Information:\n");
        output.push_str(&format!(
            "  Dimensions: {} x {}\n",
            img_info.width, img_info.height
        ));
        output.push_str(&format!("  Bit Depth: {}\n", img_info.bit_depth));
        if img_info.dimensions.len() > 2 {
            output.push_str(&format!("  Full Shape: {:?}\n", img_info.dimensions));
        }
    }

    if verbose {
        output.push_str(&format!("\nPrimary HDU - {} keywords:\n", header.len()));
        for (key, value) in header.iter() {
            output.push_str(&format!("  {:<16} = {}\n", key, value));
        }
    }

    output
}
