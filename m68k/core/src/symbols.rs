//! Address-to-symbol resolution for disassembly and trace pretty-printing.
//!
//! Images register `(name, address, size)` triples; `resolve` finds the
//! nearest covering symbol. Address zero is never symbolicated, otherwise
//! every stray null value in a trace would be labelled with whatever the
//! reset vector is called.

/// A resolved address: symbol name, its base, and the offset inside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved<'a> {
    pub name: &'a str,
    pub base: u32,
    pub offset: u32,
}

#[derive(Clone, Debug)]
struct Sym {
    name: String,
    addr: u32,
    size: u32,
}

#[derive(Clone, Debug)]
struct Image {
    name: String,
    syms: Vec<Sym>,
}

#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    images: Vec<Image>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one image's symbols. Zero-size symbols are clamped to one byte so
    /// an exact address hit still resolves. Images are consulted in the
    /// order they were added.
    pub fn add_image<I>(&mut self, image: &str, symbols: I)
    where
        I: IntoIterator<Item = (String, u32, u32)>,
    {
        let mut syms: Vec<Sym> = symbols
            .into_iter()
            .map(|(name, addr, size)| Sym {
                name,
                addr,
                size: size.max(1),
            })
            .collect();
        syms.sort_by_key(|s| s.addr);
        self.images.push(Image {
            name: image.to_string(),
            syms,
        });
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_names(&self) -> impl Iterator<Item = &str> {
        self.images.iter().map(|i| i.name.as_str())
    }

    /// Resolve `addr` to the covering symbol with the largest base. Symbols
    /// at address zero, and queries for address zero, never match.
    pub fn resolve(&self, addr: u32) -> Option<Resolved<'_>> {
        if addr == 0 {
            return None;
        }
        for image in &self.images {
            let idx = image.syms.partition_point(|s| s.addr <= addr);
            // highest base wins, so the first covering symbol walking back
            // is the answer
            for sym in image.syms[..idx].iter().rev() {
                if sym.addr != 0 && ((addr - sym.addr) as u64) < sym.size as u64 {
                    return Some(Resolved {
                        name: &sym.name,
                        base: sym.addr,
                        offset: addr - sym.addr,
                    });
                }
            }
        }
        None
    }

    /// `name` or `name+0x{offset}` for trace rendering.
    pub fn label(&self, addr: u32) -> Option<String> {
        self.resolve(addr).map(|r| {
            if r.offset == 0 {
                r.name.to_string()
            } else {
                format!("{}+{:#x}", r.name, r.offset)
            }
        })
    }
}
