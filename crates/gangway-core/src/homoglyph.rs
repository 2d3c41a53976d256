//! Unicode confusable and mixed-script detection.
//!
//! Obfuscated commands swap Latin letters for visually identical codepoints
//! from other scripts (`есhо` with Cyrillic е/с/о) to slip past pattern
//! matching. Detection is two-pronged: a precomputed codepoint-to-canonical
//! map flags individual confusable characters in O(1) per char, and a
//! script-range census flags any string mixing more than one script.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Writing-system ranges the census recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Script {
    Latin,
    Cyrillic,
    Greek,
    Arabic,
    Hebrew,
    Armenian,
    Cherokee,
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Script::Latin => "latin",
            Script::Cyrillic => "cyrillic",
            Script::Greek => "greek",
            Script::Arabic => "arabic",
            Script::Hebrew => "hebrew",
            Script::Armenian => "armenian",
            Script::Cherokee => "cherokee",
        };
        f.write_str(name)
    }
}

/// Outcome of screening a string for homoglyph obfuscation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObfuscationReport {
    /// `true` when confusables were found or scripts are mixed.
    pub flagged: bool,
    /// Confusable characters found, in order of first appearance.
    pub confusables: Vec<char>,
    /// Scripts present in the string.
    pub scripts: Vec<Script>,
}

/// Confusable codepoint -> canonical Latin letter/digit.
fn confusable_map() -> &'static HashMap<char, char> {
    static MAP: OnceLock<HashMap<char, char>> = OnceLock::new();
    MAP.get_or_init(|| {
        let pairs: &[(char, char)] = &[
            // Cyrillic lowercase look-alikes
            ('\u{0430}', 'a'), // а
            ('\u{0441}', 'c'), // с
            ('\u{0435}', 'e'), // е
            ('\u{043E}', 'o'), // о
            ('\u{0440}', 'p'), // р
            ('\u{0445}', 'x'), // х
            ('\u{0443}', 'y'), // у
            ('\u{0456}', 'i'), // і
            ('\u{0455}', 's'), // ѕ
            ('\u{0458}', 'j'), // ј
            ('\u{0501}', 'd'), // ԁ
            ('\u{051B}', 'q'), // ԛ
            ('\u{051D}', 'w'), // ԝ
            // Cyrillic uppercase look-alikes
            ('\u{0410}', 'A'),
            ('\u{0412}', 'B'),
            ('\u{0415}', 'E'),
            ('\u{041A}', 'K'),
            ('\u{041C}', 'M'),
            ('\u{041D}', 'H'),
            ('\u{041E}', 'O'),
            ('\u{0420}', 'P'),
            ('\u{0421}', 'C'),
            ('\u{0422}', 'T'),
            ('\u{0425}', 'X'),
            ('\u{0405}', 'S'),
            ('\u{0406}', 'I'),
            ('\u{0408}', 'J'),
            // Greek look-alikes
            ('\u{03B1}', 'a'), // α
            ('\u{03BF}', 'o'), // ο
            ('\u{03BD}', 'v'), // ν
            ('\u{03C1}', 'p'), // ρ
            ('\u{03C4}', 't'), // τ
            ('\u{03C5}', 'u'), // υ
            ('\u{03B9}', 'i'), // ι
            ('\u{03BA}', 'k'), // κ
            ('\u{0391}', 'A'),
            ('\u{0392}', 'B'),
            ('\u{0395}', 'E'),
            ('\u{0396}', 'Z'),
            ('\u{0397}', 'H'),
            ('\u{0399}', 'I'),
            ('\u{039A}', 'K'),
            ('\u{039C}', 'M'),
            ('\u{039D}', 'N'),
            ('\u{039F}', 'O'),
            ('\u{03A1}', 'P'),
            ('\u{03A4}', 'T'),
            ('\u{03A5}', 'Y'),
            ('\u{03A7}', 'X'),
            // Armenian look-alikes
            ('\u{0578}', 'n'), // ո
            ('\u{057D}', 'u'), // ս
            ('\u{0585}', 'o'), // օ
            ('\u{0570}', 'h'), // հ
            ('\u{0563}', 'q'), // գ
            ('\u{054F}', 'S'), // Տ
            ('\u{0555}', 'O'), // Օ
            // Cherokee look-alikes
            ('\u{13AA}', 'A'), // Ꭺ
            ('\u{13AB}', 'E'), // Ꭻ-range approximations used by confusable sets
            ('\u{13A0}', 'D'), // Ꭰ
            ('\u{13DF}', 'Z'), // Ꮿ-range
            ('\u{13A2}', 'T'), // Ꭲ
            ('\u{13B3}', 'W'), // Ꮃ
            ('\u{13BB}', 'M'), // Ꮋ
            ('\u{13C0}', 'G'), // Ꮐ
            ('\u{13C3}', 'C'), // Ꮓ-range
            // Digit look-alikes
            ('\u{04C0}', '1'), // Ӏ
            ('\u{0417}', '3'), // З
            ('\u{04E8}', '0'), // Ө
        ];
        pairs.iter().copied().collect()
    })
}

/// Canonical Latin equivalent for a confusable codepoint, if known.
pub fn canonical(c: char) -> Option<char> {
    confusable_map().get(&c).copied()
}

fn script_of(c: char) -> Option<Script> {
    match c as u32 {
        0x0041..=0x005A | 0x0061..=0x007A | 0x00C0..=0x024F => Some(Script::Latin),
        0x0370..=0x03FF => Some(Script::Greek),
        0x0400..=0x04FF | 0x0500..=0x052F => Some(Script::Cyrillic),
        0x0530..=0x058F => Some(Script::Armenian),
        0x0590..=0x05FF => Some(Script::Hebrew),
        0x0600..=0x06FF | 0x0750..=0x077F => Some(Script::Arabic),
        0x13A0..=0x13FF => Some(Script::Cherokee),
        _ => None,
    }
}

/// Screen a string for confusable characters and mixed scripts.
///
/// Flags when any character maps through the confusable table, or when
/// characters from more than one recognised script appear together.
pub fn screen(input: &str) -> ObfuscationReport {
    let mut confusables = Vec::new();
    let mut scripts = Vec::new();

    for c in input.chars() {
        if canonical(c).is_some() && !confusables.contains(&c) {
            confusables.push(c);
        }
        if let Some(script) = script_of(c) {
            if !scripts.contains(&script) {
                scripts.push(script);
            }
        }
    }

    ObfuscationReport {
        flagged: !confusables.is_empty() || scripts.len() > 1,
        confusables,
        scripts,
    }
}

/// Replace every confusable character with its canonical Latin equivalent.
///
/// Used to normalise a command before pattern matching so the canonical
/// form is what the catalogue sees.
pub fn normalize(input: &str) -> String {
    input
        .chars()
        .map(|c| canonical(c).unwrap_or(c))
        .collect()
}
