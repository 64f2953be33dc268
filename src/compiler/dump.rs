//! Disassembler for compiled code blocks.
//!
//! Works on any [`CodeBlock`], whether compiled from source or loaded from a
//! DSO. Output is either a text listing or, through serde, JSON.

use serde::Serialize;

use crate::error::DecodeError;
use crate::vm::codeblock::CodeBlock;
use crate::vm::ops::Instruction;
use crate::vm::symbols::{SymbolId, SymbolTable};
use crate::vm::value::format_float;

/// A decoded code block.
#[derive(Debug, Clone, Serialize)]
pub struct Disassembly {
    pub name: String,
    pub code_words: usize,
    pub global_strings: Vec<StringConstant>,
    pub function_strings: Vec<StringConstant>,
    pub global_floats: Vec<f64>,
    pub function_floats: Vec<f64>,
    /// Breakable lines as alternating skip/run counts.
    pub break_list: Vec<u32>,
    pub instructions: Vec<InstructionLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StringConstant {
    pub offset: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstructionLine {
    pub ip: u32,
    /// Source line when a statement starts here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub op: &'static str,
    pub operands: String,
}

/// Decode every instruction in `block`. Breakpoints are shown as the
/// instruction they stand in for.
pub fn disassemble(block: &CodeBlock, symbols: &SymbolTable) -> Result<Disassembly, DecodeError> {
    let pairs = block.line_breaks();
    let size = block.code_size() as u32;
    let mut instructions = Vec::new();
    let mut function_end: Option<u32> = None;
    let mut ip = 0;

    while ip < size {
        let mut inst = block.decode(ip)?;
        if inst == Instruction::Break {
            if let Some(opcode) = block.break_opcode(ip) {
                inst = block.decode_as(ip, opcode)?;
            }
        }
        if function_end.is_some_and(|end| ip >= end) {
            function_end = None;
        }
        let in_function = function_end.is_some();
        let operands = Operands {
            block,
            symbols,
            in_function,
        }
        .format(&inst);
        if let Instruction::FuncDecl { end_ip, has_body: true, .. } = &inst {
            function_end = Some(*end_ip);
        }

        instructions.push(InstructionLine {
            ip,
            line: pairs.iter().find(|p| p.ip == ip).map(|p| p.line()),
            op: inst.opcode().name(),
            operands,
        });
        ip += inst.size() as u32;
    }

    Ok(Disassembly {
        name: block.name().to_string(),
        code_words: size as usize,
        global_strings: split_strings(&block.global_strings()),
        function_strings: split_strings(&block.function_strings()),
        global_floats: block.global_floats().to_vec(),
        function_floats: block.function_floats().to_vec(),
        break_list: block.break_list().to_vec(),
        instructions,
    })
}

/// Non-empty NUL-terminated strings of a blob with their offsets.
fn split_strings(blob: &[u8]) -> Vec<StringConstant> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in blob.iter().enumerate() {
        if b == 0 {
            if i > start {
                out.push(StringConstant {
                    offset: start as u32,
                    text: String::from_utf8_lossy(&blob[start..i]).into_owned(),
                });
            }
            start = i + 1;
        }
    }
    out
}

struct Operands<'a> {
    block: &'a CodeBlock,
    symbols: &'a SymbolTable,
    in_function: bool,
}

impl Operands<'_> {
    fn sym(&self, id: Option<SymbolId>) -> String {
        id.map_or_else(|| "<none>".to_string(), |s| self.symbols.resolve(s).to_string())
    }

    fn string(&self, offset: u32) -> String {
        let text = self.block.string_at(offset, self.in_function).unwrap_or_default();
        format!("{offset} {}", escape(&text))
    }

    fn format(&self, inst: &Instruction) -> String {
        match inst {
            Instruction::FuncDecl {
                name,
                namespace,
                has_body,
                line,
                end_ip,
                args,
            } => {
                let args: Vec<String> = args.iter().map(|a| self.sym(*a)).collect();
                let qualified = match namespace {
                    Some(_) => format!("{}::{}", self.sym(*namespace), self.sym(*name)),
                    None => self.sym(*name),
                };
                format!(
                    "{qualified}({}) line={line} body={has_body} end={end_ip}",
                    args.join(", ")
                )
            }
            Instruction::CreateObject { fail } => format!("fail={fail}"),
            Instruction::AddObject { place_at_root } | Instruction::EndObject { place_at_root } => {
                format!("root={place_at_root}")
            }
            Instruction::JmpIffNot(t)
            | Instruction::JmpIfNot(t)
            | Instruction::JmpIff(t)
            | Instruction::JmpIf(t)
            | Instruction::JmpIfNotNp(t)
            | Instruction::JmpIfNp(t)
            | Instruction::Jmp(t) => format!("-> {t}"),
            Instruction::SetCurVar(s)
            | Instruction::SetCurVarCreate(s)
            | Instruction::SetCurField(s)
            | Instruction::LoadImmedIdent(s) => self.sym(*s),
            Instruction::LoadImmedUint(v) => (*v as i32).to_string(),
            Instruction::LoadImmedFlt(index) => {
                let value = self.block.float_at(*index, self.in_function).unwrap_or(f64::NAN);
                format!("#{index} {}", format_float(value))
            }
            Instruction::TagToStr(offset) | Instruction::LoadImmedStr(offset) => self.string(*offset),
            Instruction::CallFunc {
                name,
                namespace,
                call_type,
            } => match namespace {
                Some(_) => format!("{}::{} {:?}", self.sym(*namespace), self.sym(*name), call_type),
                None => format!("{} {:?}", self.sym(*name), call_type),
            },
            Instruction::ConcatChar(c) => escape(&(*c as char).to_string()),
            Instruction::IterBegin { var, fail } | Instruction::IterBeginStr { var, fail } => {
                format!("{} fail={fail}", self.sym(*var))
            }
            Instruction::Iter { exit } => format!("exit={exit}"),
            _ => String::new(),
        }
    }
}

fn escape(s: &str) -> String {
    format!("{s:?}")
}

impl Disassembly {
    /// Human-readable listing.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("== {} ({} words) ==\n", self.name, self.code_words));
        for (title, strings) in [
            ("Global Strings", &self.global_strings),
            ("Function Strings", &self.function_strings),
        ] {
            if strings.is_empty() {
                continue;
            }
            out.push_str(&format!("== {title} ==\n"));
            for s in strings {
                out.push_str(&format!("  [{:04}] {}\n", s.offset, escape(&s.text)));
            }
        }
        for (title, floats) in [
            ("Global Floats", &self.global_floats),
            ("Function Floats", &self.function_floats),
        ] {
            if floats.is_empty() {
                continue;
            }
            out.push_str(&format!("== {title} ==\n"));
            for (i, f) in floats.iter().enumerate() {
                out.push_str(&format!("  #{i} {}\n", format_float(*f)));
            }
        }
        out.push_str("== Code ==\n");
        for inst in &self.instructions {
            let line = inst.line.map_or_else(|| "    ".to_string(), |l| format!("{l:>4}"));
            out.push_str(&format!("{line} {:04}: {}", inst.ip, inst.op));
            if !inst.operands.is_empty() {
                out.push(' ');
                out.push_str(&inst.operands);
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;

    fn listing(source: &str) -> Disassembly {
        let mut symbols = SymbolTable::new();
        let unit = compiler::compile_resolved("d.cs", source, &mut symbols).unwrap();
        let block = CodeBlock::new("d.cs", unit);
        disassemble(&block, &symbols).unwrap()
    }

    #[test]
    fn test_listing_covers_whole_block() {
        let d = listing("function add(%a, %b) { return %a + %b; }\n$x = add(1, 2) @ \"!\";\n$y = 2.5 * $x;\n");
        assert_eq!(d.instructions[0].op, "FUNC_DECL");
        assert!(d.instructions[0].operands.starts_with("add("));
        assert!(d.instructions[0].operands.contains("line=1 body=true"));
        assert_eq!(d.instructions.last().unwrap().op, "RETURN_VOID");
        assert!(d.instructions.iter().any(|i| i.op == "CALLFUNC" && i.operands == "add Function"));
        assert!(d.global_strings.iter().any(|s| s.text == "!"));
        assert_eq!(d.global_floats, vec![2.5]);
    }

    #[test]
    fn test_function_constants_use_function_table() {
        let d = listing("function f() { return \"inside\"; }\necho(\"outside\");\n");
        let loads: Vec<&str> = d
            .instructions
            .iter()
            .filter(|i| i.op == "LOADIMMED_STR")
            .map(|i| i.operands.as_str())
            .collect();
        assert!(loads.iter().any(|o| o.ends_with("\"inside\"")));
        assert!(loads.iter().any(|o| o.ends_with("\"outside\"")));
    }

    #[test]
    fn test_breakpoints_are_transparent() {
        let mut symbols = SymbolTable::new();
        let unit = compiler::compile_resolved("d.cs", "%a = 1;\n%b = 2;\n", &mut symbols).unwrap();
        let block = CodeBlock::new("d.cs", unit);
        let before = disassemble(&block, &symbols).unwrap().to_text();
        block.set_all_breaks();
        assert_eq!(disassemble(&block, &symbols).unwrap().to_text(), before);
    }

    #[test]
    fn test_json_output() {
        let d = listing("%a = 1;\n");
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["name"], "d.cs");
        assert_eq!(json["instructions"][0]["line"], 1);
        assert!(json["instructions"].as_array().unwrap().last().unwrap().get("line").is_none());
    }
}
