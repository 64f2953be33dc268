//! Engine-provided console functions and object methods.
//!
//! Builtins receive their arguments already rendered as console strings.
//! Script-defined functions shadow builtins of the same name.

use std::path::Path;

use tracing::warn;

use crate::compiler;
use crate::error::{ConsoleError, ExecError};
use crate::vm::value::{Value, string_to_number};
use crate::vm::vm::VM;

pub type Builtin = fn(&mut VM, &[String]) -> Result<Value, ExecError>;
pub type BuiltinMethod = fn(&mut VM, u32, &[String]) -> Result<Value, ExecError>;

const FUNCTIONS: &[(&str, Builtin)] = &[
    ("echo", echo),
    ("warn", echo),
    ("error", echo),
    ("eval", eval),
    ("exec", exec),
    ("compile", compile),
    ("strlen", strlen),
    ("strupr", strupr),
    ("strlwr", strlwr),
    ("strcmp", strcmp),
    ("stricmp", stricmp),
    ("strstr", strstr),
    ("strreplace", strreplace),
    ("getSubStr", get_sub_str),
    ("trim", trim),
    ("getWord", get_word),
    ("getWordCount", get_word_count),
    ("mFloor", m_floor),
    ("mCeil", m_ceil),
    ("mAbs", m_abs),
    ("mSqrt", m_sqrt),
    ("mPow", m_pow),
    ("isObject", is_object),
    ("isFunction", is_function),
    ("nameToID", name_to_id),
    ("getTaggedString", get_tagged_string),
    ("detag", detag),
];

const METHODS: &[(&str, BuiltinMethod)] = &[
    ("getId", get_id),
    ("getName", get_name),
    ("getClassName", get_class_name),
    ("getCount", get_count),
    ("getObject", get_object),
    ("add", add),
    ("delete", delete),
    ("getFieldValue", get_field_value),
    ("setFieldValue", set_field_value),
];

/// Look up a global builtin, ignoring case.
pub fn find(name: &str) -> Option<Builtin> {
    FUNCTIONS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, f)| *f)
}

pub fn find_method(name: &str) -> Option<BuiltinMethod> {
    METHODS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, f)| *f)
}

fn arg(args: &[String], i: usize) -> &str {
    args.get(i).map_or("", String::as_str)
}

fn num(args: &[String], i: usize) -> f64 {
    string_to_number(arg(args, i))
}

fn int(args: &[String], i: usize) -> i32 {
    Value::from(arg(args, i)).to_uint() as i32
}

/// Compile errors are reported on the console; execution errors abort the
/// calling script.
fn report(vm: &mut VM, result: Result<String, ConsoleError>) -> Result<Option<String>, ExecError> {
    match result {
        Ok(s) => Ok(Some(s)),
        Err(ConsoleError::Exec(e)) => Err(e),
        Err(e) => {
            vm.print_line(&e.to_string());
            Ok(None)
        }
    }
}

// ========================================
// Console
// ========================================

fn echo(vm: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    vm.print_line(&args.concat());
    Ok(Value::empty())
}

fn eval(vm: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let result = vm.eval(arg(args, 0));
    Ok(report(vm, result)?.map_or_else(Value::empty, Value::Str))
}

fn exec(vm: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let path = arg(args, 0).to_string();
    if path.is_empty() {
        warn!("exec: no file given");
        return Ok(Value::from(false));
    }
    let result = vm.exec_file(Path::new(&path));
    Ok(Value::from(report(vm, result)?.is_some()))
}

fn compile(vm: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let source = Path::new(arg(args, 0));
    let dso = vm.dso_path(source);
    match compiler::compile_file(source, &dso) {
        Ok(_) => Ok(Value::from(true)),
        Err(e) => {
            vm.print_line(&e.to_string());
            Ok(Value::from(false))
        }
    }
}

// ========================================
// Strings
// ========================================

fn strlen(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::Uint(arg(args, 0).len() as u32))
}

fn strupr(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::Str(arg(args, 0).to_ascii_uppercase()))
}

fn strlwr(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::Str(arg(args, 0).to_ascii_lowercase()))
}

fn ordering(o: std::cmp::Ordering) -> Value {
    Value::Uint(o as i32 as u32)
}

fn strcmp(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(ordering(arg(args, 0).cmp(arg(args, 1))))
}

fn stricmp(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let a = arg(args, 0).to_ascii_lowercase();
    let b = arg(args, 1).to_ascii_lowercase();
    Ok(ordering(a.cmp(&b)))
}

fn strstr(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let index = arg(args, 0).find(arg(args, 1)).map_or(-1, |i| i as i32);
    Ok(Value::Uint(index as u32))
}

fn strreplace(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let from = arg(args, 1);
    if from.is_empty() {
        return Ok(Value::from(arg(args, 0)));
    }
    Ok(Value::Str(arg(args, 0).replace(from, arg(args, 2))))
}

fn get_sub_str(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let s = arg(args, 0);
    let start = int(args, 1).max(0) as usize;
    let count = if args.len() > 2 { int(args, 2).max(0) as usize } else { usize::MAX };
    let sub: String = s.chars().skip(start).take(count).collect();
    Ok(Value::Str(sub))
}

fn trim(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::from(arg(args, 0).trim()))
}

fn words(s: &str) -> impl Iterator<Item = &str> {
    s.split([' ', '\t', '\n']).filter(|w| !w.is_empty())
}

fn get_word(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let index = int(args, 1);
    let word = usize::try_from(index)
        .ok()
        .and_then(|i| words(arg(args, 0)).nth(i))
        .unwrap_or("");
    Ok(Value::from(word))
}

fn get_word_count(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::Uint(words(arg(args, 0)).count() as u32))
}

// ========================================
// Math
// ========================================

fn m_floor(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::Float(num(args, 0).floor()))
}

fn m_ceil(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::Float(num(args, 0).ceil()))
}

fn m_abs(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::Float(num(args, 0).abs()))
}

fn m_sqrt(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::Float(num(args, 0).sqrt()))
}

fn m_pow(_: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::Float(num(args, 0).powf(num(args, 1))))
}

// ========================================
// Objects and functions
// ========================================

fn is_object(vm: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    Ok(Value::from(vm.objects().find(arg(args, 0)).is_some()))
}

fn is_function(vm: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let name = arg(args, 0);
    Ok(Value::from(
        vm.namespaces().lookup(None, name).is_some() || find(name).is_some(),
    ))
}

fn name_to_id(vm: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let id = vm.objects().find(arg(args, 0)).map_or(-1, |id| id as i32);
    Ok(Value::Uint(id as u32))
}

fn tag_id(s: &str) -> Option<u32> {
    s.strip_prefix('\x01')?.parse().ok()
}

fn get_tagged_string(vm: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let text = tag_id(arg(args, 0)).and_then(|t| vm.tagged_string(t)).unwrap_or("");
    Ok(Value::from(text))
}

fn detag(vm: &mut VM, args: &[String]) -> Result<Value, ExecError> {
    let s = arg(args, 0);
    let text = tag_id(s).and_then(|t| vm.tagged_string(t)).unwrap_or(s);
    Ok(Value::from(text))
}

// ========================================
// Methods
// ========================================

fn get_id(_: &mut VM, id: u32, _: &[String]) -> Result<Value, ExecError> {
    Ok(Value::Uint(id))
}

fn get_name(vm: &mut VM, id: u32, _: &[String]) -> Result<Value, ExecError> {
    let name = vm.objects().get(id).and_then(|o| o.name.clone()).unwrap_or_default();
    Ok(Value::Str(name))
}

fn get_class_name(vm: &mut VM, id: u32, _: &[String]) -> Result<Value, ExecError> {
    Ok(Value::from(vm.objects().get(id).map_or("", |o| o.class)))
}

fn get_count(vm: &mut VM, id: u32, _: &[String]) -> Result<Value, ExecError> {
    let count = vm.objects().get(id).map_or(0, |o| o.children.len());
    Ok(Value::Uint(count as u32))
}

fn get_object(vm: &mut VM, id: u32, args: &[String]) -> Result<Value, ExecError> {
    let child = usize::try_from(int(args, 0))
        .ok()
        .and_then(|i| vm.objects().get(id)?.children.get(i).copied());
    match child {
        Some(child) => Ok(Value::Uint(child)),
        None => {
            warn!(id, index = arg(args, 0), "getObject: index out of range");
            Ok(Value::Uint(u32::MAX))
        }
    }
}

fn add(vm: &mut VM, id: u32, args: &[String]) -> Result<Value, ExecError> {
    for reference in args {
        match vm.objects().find(reference) {
            Some(child) => {
                if !vm.objects_mut().add_child(id, child) {
                    warn!(id, child, "add: object cannot hold children");
                }
            }
            None => warn!("add: unable to find object '{reference}'"),
        }
    }
    Ok(Value::empty())
}

fn delete(vm: &mut VM, id: u32, _: &[String]) -> Result<Value, ExecError> {
    vm.objects_mut().delete(id);
    Ok(Value::empty())
}

fn get_field_value(vm: &mut VM, id: u32, args: &[String]) -> Result<Value, ExecError> {
    let value = vm.objects().get(id).and_then(|o| o.field(arg(args, 0))).unwrap_or("");
    Ok(Value::from(value))
}

fn set_field_value(vm: &mut VM, id: u32, args: &[String]) -> Result<Value, ExecError> {
    if let Some(obj) = vm.objects_mut().get_mut(id) {
        obj.set_field(arg(args, 0), arg(args, 1).to_string());
    }
    Ok(Value::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn call(vm: &mut VM, name: &str, args: &[&str]) -> String {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        find(name).unwrap()(vm, &args).unwrap().into_console_string()
    }

    #[test]
    fn test_lookup_ignores_case() {
        assert!(find("ECHO").is_some());
        assert!(find("getsubstr").is_some());
        assert!(find("nope").is_none());
        assert!(find_method("GETNAME").is_some());
    }

    #[test]
    fn test_string_builtins() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        assert_eq!(call(&mut vm, "strlen", &["hello"]), "5");
        assert_eq!(call(&mut vm, "strupr", &["aBc"]), "ABC");
        assert_eq!(call(&mut vm, "strcmp", &["a", "b"]), "-1");
        assert_eq!(call(&mut vm, "stricmp", &["ABC", "abc"]), "0");
        assert_eq!(call(&mut vm, "strstr", &["hello", "ll"]), "2");
        assert_eq!(call(&mut vm, "strstr", &["hello", "z"]), "-1");
        assert_eq!(call(&mut vm, "getSubStr", &["console", "3", "2"]), "so");
        assert_eq!(call(&mut vm, "getSubStr", &["console", "3"]), "sole");
        assert_eq!(call(&mut vm, "trim", &["  x  "]), "x");
        assert_eq!(call(&mut vm, "getWord", &["a b  c", "2"]), "c");
        assert_eq!(call(&mut vm, "getWord", &["a b", "-1"]), "");
        assert_eq!(call(&mut vm, "getWordCount", &[" a\tb c "]), "3");
        assert_eq!(call(&mut vm, "strreplace", &["a-b-c", "-", "+"]), "a+b+c");
    }

    #[test]
    fn test_math_builtins() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        assert_eq!(call(&mut vm, "mFloor", &["2.7"]), "2");
        assert_eq!(call(&mut vm, "mCeil", &["2.1"]), "3");
        assert_eq!(call(&mut vm, "mAbs", &["-4"]), "4");
        assert_eq!(call(&mut vm, "mSqrt", &["16"]), "4");
        assert_eq!(call(&mut vm, "mPow", &["2", "10"]), "1024");
    }

    #[test]
    fn test_object_builtins() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        let set = vm.objects_mut().create("SimSet", Some("Set")).unwrap();
        let obj = vm.objects_mut().create("ScriptObject", None).unwrap();
        assert_eq!(call(&mut vm, "isObject", &["set"]), "1");
        assert_eq!(call(&mut vm, "nameToID", &["Set"]), set.to_string());
        assert_eq!(call(&mut vm, "nameToID", &["missing"]), "-1");

        let m = |name| find_method(name).unwrap();
        m("add")(&mut vm, set, &[obj.to_string()]).unwrap();
        assert_eq!(m("getCount")(&mut vm, set, &[]).unwrap().to_console_string(), "1");
        assert_eq!(m("getObject")(&mut vm, set, &["0".into()]).unwrap(), Value::Uint(obj));
        m("setFieldValue")(&mut vm, obj, &["Color".into(), "red".into()]).unwrap();
        assert_eq!(m("getFieldValue")(&mut vm, obj, &["color".into()]).unwrap(), Value::from("red"));
        m("delete")(&mut vm, set, &[]).unwrap();
        let obj = obj.to_string();
        assert_eq!(call(&mut vm, "isObject", &[obj.as_str()]), "0");
    }

    #[test]
    fn test_eval_reports_syntax_errors() {
        let mut vm = VM::with_output(Box::new(io::sink()));
        assert_eq!(call(&mut vm, "eval", &["return 1 +;"]), "");
        assert_eq!(call(&mut vm, "eval", &["return 1 + 2;"]), "3");
    }
}
