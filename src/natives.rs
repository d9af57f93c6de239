use super::object::NativeFn;
use super::value::{self, Value};
use super::vm::Vm;
use std::f64::consts::PI;
use std::io::{self, BufRead};

/// Seconds since the VM was created.
pub fn clock(vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(0, argc)?;
    Ok(Value::from(vm.uptime().as_secs_f64()))
}

pub fn to_int(vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(1, argc)?;
    let n = vm.get_number(1, argc)?;
    Ok(Value::from(n.trunc()))
}

pub fn sin(vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(1, argc)?;
    let n = vm.get_number(1, argc)?;
    Ok(Value::from(n.sin()))
}

pub fn cos(vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(1, argc)?;
    let n = vm.get_number(1, argc)?;
    Ok(Value::from(n.cos()))
}

pub fn pi(_vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(0, argc)?;
    Ok(Value::from(PI))
}

/// Reads a line from stdin, truncated to `len` characters.
pub fn console_input(vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(1, argc)?;
    let len = vm.get_pos_int(1, argc)? as usize;

    let mut buffer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut buffer)
        .map_err(|err| format!("Couldn't read from stdin: {}.", err))?;
    while buffer.ends_with('\n') || buffer.ends_with('\r') {
        buffer.pop();
    }
    let input: String = buffer.chars().take(len).collect();

    let string = vm.intern(&input);
    Ok(Value::from(string))
}

pub fn clear(vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(0, argc)?;
    vm.write_str("\x1b[2J\x1b[1;1H");
    Ok(value::NIL)
}

pub fn err(vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(1, argc)?;
    let msg = vm.get_string(1, argc)?;
    vm.write_str(&format!("Error thrown: {}\n", msg));
    Ok(value::NIL)
}

pub fn endl(vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(0, argc)?;
    vm.write_str("\n");
    Ok(value::NIL)
}

pub const NATIVES: [(&str, NativeFn); 9] = [
    ("clock", clock),
    ("to_int", to_int),
    ("sin", sin),
    ("cos", cos),
    ("pi", pi),
    ("c_in", console_input),
    ("clear", clear),
    ("err", err),
    ("endl", endl),
];
