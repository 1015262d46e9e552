//! Textual form of a module.
//!
//! The format is MLIR-flavoured and meant for humans and snapshot tests; there
//! is no parser for it. Values print as `%<arena index>`.

use std::fmt::{self, Write};

use crate::module::{Module, Visibility};
use crate::ops::{BlockId, OpId};

fn join<T: fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Module {
    /// One-line form of `op`, without the contents of its regions.
    pub fn op_to_string(&self, op: OpId) -> String {
        let data = self.op(op);
        let mut out = String::new();
        if !data.results.is_empty() {
            let _ = write!(out, "{} = ", join(&data.results));
        }
        let _ = write!(out, "{}({})", data.kind.name(), join(&data.operands));
        let mut attrs: Vec<String> = data
            .kind
            .fields()
            .into_iter()
            .map(|(name, value)| format!("{name} = {value}"))
            .collect();
        attrs.extend(data.attrs.iter().map(|(name, value)| format!("{name} = {value}")));
        if !attrs.is_empty() {
            let _ = write!(out, " {{{}}}", attrs.join(", "));
        }
        if !data.results.is_empty() {
            let _ = write!(
                out,
                " : {}",
                join(data.results.iter().map(|&r| self.value_type(r)))
            );
        }
        out
    }

    fn fmt_block(&self, f: &mut fmt::Formatter<'_>, block: BlockId, depth: usize) -> fmt::Result {
        for &op in &self.block(block).ops {
            write!(f, "{:indent$}{}", "", self.op_to_string(op), indent = depth * 2)?;
            for &region in &self.op(op).regions {
                writeln!(f, " {{")?;
                self.fmt_block(f, region, depth + 1)?;
                write!(f, "{:indent$}}}", "", indent = depth * 2)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module @{} {{", self.name)?;
        for (id, func) in self.functions() {
            let params: Vec<String> = self
                .args(id)
                .iter()
                .zip(&func.arg_attrs)
                .map(|(&arg, attrs)| {
                    let mut param = format!("{arg}: {}", self.value_type(arg));
                    if !attrs.is_empty() {
                        let attrs = join(attrs.iter().map(|(k, v)| format!("{k} = {v}")));
                        param.push_str(&format!(" {{{attrs}}}"));
                    }
                    param
                })
                .collect();
            let visibility = match func.visibility {
                Visibility::Public => "",
                Visibility::Private => "private ",
            };
            write!(f, "  func {visibility}@{}({})", func.name, params.join(", "))?;
            if !func.result_types.is_empty() {
                write!(f, " -> ({})", join(&func.result_types))?;
            }
            writeln!(f, " {{")?;
            self.fmt_block(f, func.entry, 2)?;
            writeln!(f, "  }}")?;
        }
        writeln!(f, "}}")
    }
}
