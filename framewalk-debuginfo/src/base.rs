use std::borrow::Cow;
use std::iter::FromIterator;
use std::ops::Deref;

/// A function symbol from a symbol table.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Symbol<'data> {
    /// The name of the symbol.
    ///
    /// This name is generally mangled. Synthesized PLT stubs are named `function@plt`.
    pub name: Option<Cow<'data, str>>,

    /// The address of this symbol relative to the load address of its object.
    pub address: u64,

    /// The size of this symbol, or zero if the symbol table does not declare it.
    pub size: u64,
}

impl<'data> Symbol<'data> {
    /// Returns the name of this symbol as string.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Determines whether the given address is covered by this symbol.
    ///
    /// A symbol without size covers everything from its address onwards.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && (self.size == 0 || address - self.address < self.size)
    }
}

/// Function symbols sorted by address.
///
/// When collected, symbols sharing an address are reduced to the first one, and symbols without
/// a size are extended up to the next symbol. Only the last symbol may remain without size.
///
/// ```rust
/// # use framewalk_debuginfo::{Symbol, SymbolMap};
/// let map: SymbolMap = vec![
///     Symbol { name: Some("B".into()), address: 0x4200, size: 0 },
///     Symbol { name: Some("A".into()), address: 0x4000, size: 0 },
/// ]
/// .into_iter()
/// .collect();
///
/// assert_eq!(map[0].size, 0x200);
/// assert_eq!(map.lookup(0x4210).and_then(Symbol::name), Some("B"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct SymbolMap<'data> {
    symbols: Vec<Symbol<'data>>,
}

impl<'data> SymbolMap<'data> {
    /// Looks up the symbol covering the given address.
    pub fn lookup(&self, address: u64) -> Option<&Symbol<'data>> {
        let after = self.symbols.partition_point(|s| s.address <= address);
        let symbol = self.symbols.get(after.checked_sub(1)?)?;
        symbol.contains(address).then_some(symbol)
    }
}

impl<'data> Deref for SymbolMap<'data> {
    type Target = [Symbol<'data>];

    fn deref(&self) -> &Self::Target {
        &self.symbols
    }
}

impl<'data> FromIterator<Symbol<'data>> for SymbolMap<'data> {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Symbol<'data>>,
    {
        let mut symbols: Vec<_> = iter.into_iter().collect();

        // The sort is stable, so the first alias at an address is kept.
        dmsort::sort_by_key(&mut symbols, |symbol| symbol.address);
        symbols.dedup_by_key(|symbol| symbol.address);

        for index in 1..symbols.len() {
            let next = symbols[index].address;
            let symbol = &mut symbols[index - 1];
            if symbol.size == 0 {
                symbol.size = next - symbol.address;
            }
        }

        Self { symbols }
    }
}
