//! Alphabet <-> integer token maps.
//!
//! Grounded on the `Tokenizer<Symbol,Token>` template in
//! `original_source/src/eval.h`: token `0` is reserved for the empty
//! string (the "no symbol on this tape" sentinel), and every other symbol
//! gets a dense index in iteration order.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::machine::Symbol;

/// Dense integer token assigned to the empty-symbol sentinel.
pub const EMPTY_TOKEN: usize = 0;

/// A bijection between an alphabet and the dense integers `1..=|alphabet|`,
/// plus the reserved `0` for "no symbol".
#[derive(Debug, Clone)]
pub struct Tokenizer {
    tok2sym: Vec<Option<Symbol>>,
    sym2tok: HashMap<Symbol, usize>,
}

impl Tokenizer {
    /// Builds a tokenizer from an alphabet given in any deterministic
    /// order (callers typically pass a `BTreeSet` for reproducibility).
    pub fn new(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        let mut tok2sym = vec![None];
        let mut sym2tok = HashMap::new();
        for sym in symbols {
            let tok = tok2sym.len();
            sym2tok.insert(sym.clone(), tok);
            tok2sym.push(Some(sym));
        }
        Tokenizer { tok2sym, sym2tok }
    }

    /// The token for "no symbol on this tape".
    pub fn empty_token() -> usize {
        EMPTY_TOKEN
    }

    /// Number of real symbols (excluding the empty-token sentinel).
    pub fn len(&self) -> usize {
        self.tok2sym.len() - 1
    }

    /// Whether the alphabet is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Token for `sym`, or `EMPTY_TOKEN` if `sym` is `None`.
    pub fn token_of(&self, sym: Option<&Symbol>) -> Result<usize> {
        match sym {
            None => Ok(EMPTY_TOKEN),
            Some(s) => self
                .sym2tok
                .get(s)
                .copied()
                .ok_or_else(|| Error::Reference(format!("symbol `{s}` is not in this tokenizer's alphabet"))),
        }
    }

    /// Symbol for `tok`, or `None` for the empty-token sentinel.
    pub fn symbol_of(&self, tok: usize) -> Option<&Symbol> {
        self.tok2sym.get(tok).and_then(|s| s.as_ref())
    }

    /// Tokenizes a whole sequence of symbols (no empty tokens appear in a
    /// sequence itself, only on transitions).
    pub fn tokenize(&self, seq: &[Symbol]) -> Result<Vec<usize>> {
        seq.iter().map(|s| self.token_of(Some(s))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_reserved() {
        let t = Tokenizer::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(t.token_of(None).unwrap(), EMPTY_TOKEN);
        assert_eq!(t.symbol_of(EMPTY_TOKEN), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn round_trips_symbols() {
        let t = Tokenizer::new(vec!["x".to_string(), "y".to_string()]);
        let tx = t.token_of(Some(&"x".to_string())).unwrap();
        assert_eq!(t.symbol_of(tx), Some(&"x".to_string()));
    }

    #[test]
    fn unknown_symbol_errors() {
        let t = Tokenizer::new(vec!["x".to_string()]);
        assert!(t.token_of(Some(&"z".to_string())).is_err());
    }
}
