//! End-to-end tests: program file -> compiler -> reference machine.

use bcx86::bytecode::ArrayType;
use bcx86::meta::layout;
use bcx86::sim::{Fault, Runtime, Value};
use bcx86::{Build, Program};

fn build(src: &str) -> Build {
    Build::new(&Program::parse(src).unwrap()).unwrap()
}

fn runtime(build: &Build) -> Runtime {
    build.runtime().unwrap()
}

fn call(build: &Build, method: &str, args: &[Value]) -> Result<Option<Value>, Fault> {
    runtime(build).invoke(method, args)
}

fn int(build: &Build, method: &str, args: &[Value]) -> i32 {
    match call(build, method, args).unwrap() {
        Some(Value::Int(v)) => v,
        other => panic!("{} returned {:?}", method, other),
    }
}

const OBJECTS: &str = r#"
[[class]]
name = "demo/Shape"
interface = true

[[class.method]]
name = "area"
descriptor = "()I"

[[class]]
name = "demo/Base"
initialized = true

[[class.field]]
name = "w"
descriptor = "I"

[[class.method]]
name = "area"
descriptor = "()I"
max_locals = 1
code = [{ aload = 0 }, { getfield = "demo/Base.w:I" }, "ireturn"]

[[class.method]]
name = "kind"
descriptor = "()I"
max_locals = 1
code = [{ iconst = 1 }, "ireturn"]

[[class]]
name = "demo/Square"
super = "demo/Base"
interfaces = ["demo/Shape"]
initialized = true

[[class.method]]
name = "area"
descriptor = "()I"
max_locals = 1
code = [
    { aload = 0 },
    { getfield = "demo/Base.w:I" },
    "dup",
    "imul",
    "ireturn",
]

[[class]]
name = "demo/Oops"
initialized = true

[[class]]
name = "demo/Main"
initialized = true

[[class.method]]
name = "square"
descriptor = "(I)I"
static = true
max_locals = 2
code = [
    { new = "demo/Square" },
    "dup",
    { astore = 1 },
    { iload = 0 },
    { putfield = "demo/Base.w:I" },
    { aload = 1 },
    { invokevirtual = "demo/Base.area()I" },
    "ireturn",
]

[[class.method]]
name = "base"
descriptor = "(I)I"
static = true
max_locals = 2
code = [
    { new = "demo/Base" },
    "dup",
    { astore = 1 },
    { iload = 0 },
    { putfield = "demo/Base.w:I" },
    { aload = 1 },
    { invokevirtual = "demo/Base.area()I" },
    "ireturn",
]

[[class.method]]
name = "viaInterface"
descriptor = "(I)I"
static = true
max_locals = 2
code = [
    { new = "demo/Square" },
    "dup",
    { astore = 1 },
    { iload = 0 },
    { putfield = "demo/Base.w:I" },
    { aload = 1 },
    { invokeinterface = "demo/Shape.area()I" },
    "ireturn",
]

[[class.method]]
name = "inherited"
descriptor = "()I"
static = true
max_locals = 0
code = [
    { new = "demo/Square" },
    { invokevirtual = "demo/Base.kind()I" },
    "ireturn",
]

[[class.method]]
name = "isShape"
descriptor = "(Ldemo/Base;)I"
static = true
max_locals = 1
code = [{ aload = 0 }, { instanceof = "demo/Shape" }, "ireturn"]

[[class.method]]
name = "cast"
descriptor = "(Ldemo/Base;)I"
static = true
max_locals = 1
code = [
    { aload = 0 },
    { checkcast = "demo/Square" },
    { getfield = "demo/Base.w:I" },
    "ireturn",
]

[[class.method]]
name = "boom"
descriptor = "()V"
static = true
code = [{ new = "demo/Oops" }, "athrow"]

[[class.method]]
name = "nullField"
descriptor = "()I"
static = true
code = ["aconst_null", { getfield = "demo/Base.w:I" }, "ireturn"]

[[class.method]]
name = "locked"
descriptor = "(I)I"
static = true
max_locals = 2
code = [
    { new = "demo/Base" },
    "dup",
    { astore = 1 },
    "monitorenter",
    { iload = 0 },
    { aload = 1 },
    "monitorexit",
    "ireturn",
]

[[class.method]]
name = "storeShape"
descriptor = "(Ldemo/Base;)I"
static = true
max_locals = 2
code = [
    { iconst = 2 },
    { anewarray = "demo/Shape" },
    "dup",
    { astore = 1 },
    { iconst = 1 },
    { aload = 0 },
    "aastore",
    { aload = 1 },
    "arraylength",
    "ireturn",
]

[[class.method]]
name = "boxShape"
descriptor = "(Ldemo/Base;)[Ldemo/Shape;"
static = true
max_locals = 1
code = [
    { iconst = 1 },
    { anewarray = "demo/Shape" },
    "dup",
    { iconst = 0 },
    { aload = 0 },
    "aastore",
    "areturn",
]
"#;

#[test]
fn test_virtual_dispatch_uses_override() {
    let b = build(OBJECTS);
    assert_eq!(int(&b, "demo/Main.square(I)I", &[Value::Int(7)]), 49);
    assert_eq!(int(&b, "demo/Main.base(I)I", &[Value::Int(7)]), 7);
    assert_eq!(int(&b, "demo/Main.inherited()I", &[]), 1);
}

#[test]
fn test_interface_dispatch_single_entry() {
    let b = build(OBJECTS);
    assert_eq!(int(&b, "demo/Main.viaInterface(I)I", &[Value::Int(-6)]), 36);
}

#[test]
fn test_instanceof_and_checkcast() {
    let b = build(OBJECTS);
    let mut rt = runtime(&b);
    let square = rt.new_object("demo/Square").unwrap();
    let base = rt.new_object("demo/Base").unwrap();
    let method = "demo/Main.isShape(Ldemo/Base;)I";
    assert_eq!(rt.invoke(method, &[Value::Reference(square)]).unwrap(), Some(Value::Int(1)));
    assert_eq!(rt.invoke(method, &[Value::Reference(base)]).unwrap(), Some(Value::Int(0)));
    assert_eq!(rt.invoke(method, &[Value::Reference(0)]).unwrap(), Some(Value::Int(0)));

    let cast = "demo/Main.cast(Ldemo/Base;)I";
    assert_eq!(rt.invoke(cast, &[Value::Reference(square)]).unwrap(), Some(Value::Int(0)));
    assert_eq!(
        rt.invoke(cast, &[Value::Reference(base)]).unwrap_err(),
        Fault::ClassCast("demo/Base".into(), "demo/Square".into())
    );
}

const ARRAY_TYPES: &str = r#"
[[class]]
name = "java/lang/Object"
initialized = true

[[class]]
name = "demo/Shape"
interface = true

[[class]]
name = "demo/Sq"
super = "java/lang/Object"
interfaces = ["demo/Shape"]
initialized = true

[[class]]
name = "demo/Arr"
initialized = true

[[class.method]]
name = "isInts"
descriptor = "(Ljava/lang/Object;)I"
static = true
max_locals = 1
code = [{ aload = 0 }, { instanceof = "[I" }, "ireturn"]

[[class.method]]
name = "isLongs"
descriptor = "(Ljava/lang/Object;)I"
static = true
max_locals = 1
code = [{ aload = 0 }, { instanceof = "[J" }, "ireturn"]

[[class.method]]
name = "isObject"
descriptor = "(Ljava/lang/Object;)I"
static = true
max_locals = 1
code = [{ aload = 0 }, { instanceof = "java/lang/Object" }, "ireturn"]

[[class.method]]
name = "isShapes"
descriptor = "(Ljava/lang/Object;)I"
static = true
max_locals = 1
code = [{ aload = 0 }, { instanceof = "[Ldemo/Shape;" }, "ireturn"]

[[class.method]]
name = "isObjects"
descriptor = "(Ljava/lang/Object;)I"
static = true
max_locals = 1
code = [{ aload = 0 }, { instanceof = "[Ljava/lang/Object;" }, "ireturn"]

[[class.method]]
name = "castInts"
descriptor = "(Ljava/lang/Object;)I"
static = true
max_locals = 1
code = [{ aload = 0 }, { checkcast = "[I" }, "arraylength", "ireturn"]

[[class.method]]
name = "squares"
descriptor = "()Ljava/lang/Object;"
static = true
code = [{ iconst = 2 }, { anewarray = "demo/Sq" }, "areturn"]

[[class.method]]
name = "grid"
descriptor = "()Ljava/lang/Object;"
static = true
code = [
    { iconst = 2 },
    { iconst = 3 },
    { multianewarray = { class = "[[I", dims = 2 } },
    "areturn",
]
"#;

#[test]
fn test_array_classes_in_type_checks() {
    let b = build(ARRAY_TYPES);
    let mut rt = runtime(&b);
    let check = |rt: &mut Runtime, method: &str, object: u32| -> i32 {
        let id = format!("demo/Arr.{}(Ljava/lang/Object;)I", method);
        match rt.invoke(&id, &[Value::Reference(object)]).unwrap() {
            Some(Value::Int(v)) => v,
            other => panic!("{} returned {:?}", id, other),
        }
    };
    let ints = rt.new_array(ArrayType::Int, &[1, 2, 3]).unwrap();
    let longs = rt.new_array(ArrayType::Long, &[1]).unwrap();
    let square = rt.new_object("demo/Sq").unwrap();
    assert_eq!(rt.class_of(ints).unwrap(), "[I");

    assert_eq!(check(&mut rt, "isInts", ints), 1);
    assert_eq!(check(&mut rt, "isInts", longs), 0);
    assert_eq!(check(&mut rt, "isLongs", ints), 0);
    assert_eq!(check(&mut rt, "isLongs", longs), 1);
    assert_eq!(check(&mut rt, "isObject", ints), 1);
    assert_eq!(check(&mut rt, "isObject", square), 1);
    assert_eq!(check(&mut rt, "isShapes", ints), 0);
    assert_eq!(check(&mut rt, "isObjects", ints), 0);
    assert_eq!(check(&mut rt, "isInts", square), 0);

    let squares = match rt.invoke("demo/Arr.squares()Ljava/lang/Object;", &[]).unwrap() {
        Some(Value::Reference(a)) => a,
        other => panic!("squares returned {:?}", other),
    };
    assert_eq!(rt.class_of(squares).unwrap(), "[Ldemo/Sq;");
    assert_eq!(check(&mut rt, "isShapes", squares), 1);
    assert_eq!(check(&mut rt, "isObjects", squares), 1);
    assert_eq!(check(&mut rt, "isObject", squares), 1);
    assert_eq!(check(&mut rt, "isInts", squares), 0);

    let grid = match rt.invoke("demo/Arr.grid()Ljava/lang/Object;", &[]).unwrap() {
        Some(Value::Reference(a)) => a,
        other => panic!("grid returned {:?}", other),
    };
    let row = rt.array_element(grid, 1).unwrap() as u32;
    assert_eq!(rt.class_of(grid).unwrap(), "[[I");
    assert_eq!(rt.class_of(row).unwrap(), "[I");
    assert_eq!(check(&mut rt, "isObjects", grid), 1);
    assert_eq!(check(&mut rt, "isInts", grid), 0);
    assert_eq!(check(&mut rt, "isInts", row), 1);

    assert_eq!(check(&mut rt, "castInts", ints), 3);
    assert_eq!(check(&mut rt, "castInts", row), 3);
    assert_eq!(
        rt.invoke("demo/Arr.castInts(Ljava/lang/Object;)I", &[Value::Reference(longs)])
            .unwrap_err(),
        Fault::ClassCast("[J".into(), "[I".into())
    );
    assert!(rt.new_object("[I").is_err());
}

#[test]
fn test_array_store_check() {
    let b = build(OBJECTS);
    let mut rt = runtime(&b);
    let square = rt.new_object("demo/Square").unwrap();
    let base = rt.new_object("demo/Base").unwrap();
    let method = "demo/Main.storeShape(Ldemo/Base;)I";
    assert_eq!(rt.invoke(method, &[Value::Reference(square)]).unwrap(), Some(Value::Int(2)));
    assert_eq!(rt.invoke(method, &[Value::Reference(0)]).unwrap(), Some(Value::Int(2)));
    assert_eq!(
        rt.invoke(method, &[Value::Reference(base)]).unwrap_err(),
        Fault::ArrayStore("demo/Base".into(), "demo/Shape".into())
    );
}

#[test]
fn test_reference_array_store_marks_card() {
    let b = build(OBJECTS);
    let mut rt = runtime(&b);
    let square = rt.new_object("demo/Square").unwrap();
    let method = "demo/Main.boxShape(Ldemo/Base;)[Ldemo/Shape;";
    let array = match rt.invoke(method, &[Value::Reference(square)]).unwrap() {
        Some(Value::Reference(a)) => a,
        other => panic!("{} returned {:?}", method, other),
    };
    assert_eq!(rt.array_element(array, 0).unwrap(), square as u64);
    let card = b.env.card_table + (array >> layout::CARD_SHIFT);
    assert_eq!(rt.machine().mem.read_u8(card), Ok(1));
}

#[test]
fn test_runtime_faults() {
    let b = build(OBJECTS);
    assert_eq!(
        call(&b, "demo/Main.boom()V", &[]).unwrap_err(),
        Fault::Thrown("demo/Oops".into())
    );
    assert_eq!(call(&b, "demo/Main.nullField()I", &[]).unwrap_err(), Fault::NullPointer);
}

#[test]
fn test_monitors_balance() {
    let b = build(OBJECTS);
    assert_eq!(int(&b, "demo/Main.locked(I)I", &[Value::Int(9)]), 9);
}

const STATICS: &str = r#"
[[class]]
name = "demo/Conf"

[[class.field]]
name = "value"
descriptor = "I"
static = true

[[class.method]]
name = "<clinit>"
descriptor = "()V"
static = true
code = [{ iconst = 42 }, { putstatic = "demo/Conf.value:I" }, "return"]

[[class]]
name = "demo/Main"
initialized = true

[[class.field]]
name = "total"
descriptor = "J"
static = true

[[class.method]]
name = "get"
descriptor = "()I"
static = true
code = [{ getstatic = "demo/Conf.value:I" }, "ireturn"]

[[class.method]]
name = "accumulate"
descriptor = "(J)J"
static = true
max_locals = 2
code = [
    { getstatic = "demo/Main.total:J" },
    { lload = 0 },
    "ladd",
    "dup2",
    { putstatic = "demo/Main.total:J" },
    "lreturn",
]

[[class.method]]
name = "hello"
descriptor = "()I"
static = true
code = [{ ldc = { string = "hello" } }, "arraylength", "ireturn"]
"#;

#[test]
fn test_class_initializer_runs_on_first_access() {
    let b = build(STATICS);
    let mut rt = runtime(&b);
    assert!(!rt.is_initialized("demo/Conf").unwrap());
    assert_eq!(rt.invoke("demo/Main.get()I", &[]).unwrap(), Some(Value::Int(42)));
    assert!(rt.is_initialized("demo/Conf").unwrap());
    assert_eq!(rt.invoke("demo/Main.get()I", &[]).unwrap(), Some(Value::Int(42)));
}

#[test]
fn test_wide_static_field() {
    let b = build(STATICS);
    let mut rt = runtime(&b);
    let method = "demo/Main.accumulate(J)J";
    let big = 0x1_0000_0000;
    assert_eq!(rt.invoke(method, &[Value::Long(big)]).unwrap(), Some(Value::Long(big)));
    assert_eq!(rt.invoke(method, &[Value::Long(-1)]).unwrap(), Some(Value::Long(big - 1)));
}

#[test]
fn test_string_constant() {
    let b = build(STATICS);
    assert_eq!(int(&b, "demo/Main.hello()I", &[]), 5);
}

const CONTROL: &str = r#"
[[class]]
name = "demo/Flow"
initialized = true

[[class.method]]
name = "classify"
descriptor = "(I)I"
static = true
max_locals = 1
code = [
    { iload = 0 },
    { tableswitch = { default = 8, low = 1, targets = [2, 4, 6] } },
    { iconst = 10 },
    "ireturn",
    { iconst = 20 },
    "ireturn",
    { iconst = 30 },
    "ireturn",
    { iconst = -1 },
    "ireturn",
]

[[class.method]]
name = "lookup"
descriptor = "(I)I"
static = true
max_locals = 1
code = [
    { iload = 0 },
    { lookupswitch = { default = 8, pairs = [[-5, 2], [7, 4], [100, 6]] } },
    { iconst = 1 },
    "ireturn",
    { iconst = 2 },
    "ireturn",
    { iconst = 3 },
    "ireturn",
    { iconst = 0 },
    "ireturn",
]

[[class.method]]
name = "subroutine"
descriptor = "()I"
static = true
max_locals = 2
code = [
    { iconst = 0 },
    { istore = 0 },
    { jsr = 6 },
    { jsr = 6 },
    { iload = 0 },
    "ireturn",
    { astore = 1 },
    { iinc = { index = 0, delta = 5 } },
    { ret = 1 },
]

[[class.method]]
name = "sumLongs"
descriptor = "(I)J"
static = true
max_locals = 5
code = [
    { iload = 0 },
    { newarray = "long" },
    { astore = 1 },
    { iconst = 0 },
    { istore = 2 },
    { iload = 2 },
    { iload = 0 },
    { if_icmpge = 17 },
    { aload = 1 },
    { iload = 2 },
    { iload = 2 },
    "i2l",
    { lconst = 4294967296 },
    "lmul",
    "lastore",
    { iinc = { index = 2, delta = 1 } },
    { goto = 5 },
    { lconst = 0 },
    { lstore = 3 },
    { iconst = 0 },
    { istore = 2 },
    { iload = 2 },
    { iload = 0 },
    { if_icmpge = 32 },
    { lload = 3 },
    { aload = 1 },
    { iload = 2 },
    "laload",
    "ladd",
    { lstore = 3 },
    { iinc = { index = 2, delta = 1 } },
    { goto = 21 },
    { lload = 3 },
    "lreturn",
]

[[class.method]]
name = "grid"
descriptor = "()I"
static = true
max_locals = 1
code = [
    { iconst = 3 },
    { iconst = 4 },
    { multianewarray = { class = "[[I", dims = 2 } },
    { astore = 0 },
    { aload = 0 },
    "arraylength",
    { iconst = 10 },
    "imul",
    { aload = 0 },
    { iconst = 2 },
    "aaload",
    "arraylength",
    "iadd",
    "ireturn",
]

[[class.method]]
name = "alloc"
descriptor = "(I)I"
static = true
max_locals = 1
code = [{ iload = 0 }, { newarray = "byte" }, "arraylength", "ireturn"]

[[class.method]]
name = "div"
descriptor = "(II)I"
static = true
max_locals = 2
code = [{ iload = 0 }, { iload = 1 }, "idiv", "ireturn"]

[[class.method]]
name = "rem"
descriptor = "(II)I"
static = true
max_locals = 2
code = [{ iload = 0 }, { iload = 1 }, "irem", "ireturn"]

[[class.method]]
name = "narrow"
descriptor = "(I)I"
static = true
max_locals = 1
code = [
    { iload = 0 },
    "i2b",
    { iload = 0 },
    "i2c",
    "iadd",
    { iload = 0 },
    "i2s",
    "ixor",
    "ireturn",
]
"#;

#[test]
fn test_tableswitch() {
    let b = build(CONTROL);
    for (input, expected) in [(0, -1), (1, 10), (2, 20), (3, 30), (4, -1), (i32::MIN, -1)] {
        assert_eq!(int(&b, "demo/Flow.classify(I)I", &[Value::Int(input)]), expected);
    }
}

#[test]
fn test_lookupswitch() {
    let b = build(CONTROL);
    for (input, expected) in [(-5, 1), (7, 2), (100, 3), (0, 0), (6, 0), (i32::MAX, 0)] {
        assert_eq!(int(&b, "demo/Flow.lookup(I)I", &[Value::Int(input)]), expected);
    }
}

#[test]
fn test_subroutine_returns_twice() {
    let b = build(CONTROL);
    assert_eq!(int(&b, "demo/Flow.subroutine()I", &[]), 10);
}

#[test]
fn test_long_array_loop() {
    let b = build(CONTROL);
    for n in [0i64, 1, 5, 20] {
        let result = call(&b, "demo/Flow.sumLongs(I)J", &[Value::Int(n as i32)]).unwrap();
        assert_eq!(result, Some(Value::Long((n * (n - 1) / 2) << 32)));
    }
}

#[test]
fn test_multi_dimensional_array() {
    let b = build(CONTROL);
    assert_eq!(int(&b, "demo/Flow.grid()I", &[]), 34);
}

#[test]
fn test_array_allocation_sizes() {
    let b = build(CONTROL);
    assert_eq!(int(&b, "demo/Flow.alloc(I)I", &[Value::Int(0)]), 0);
    assert_eq!(int(&b, "demo/Flow.alloc(I)I", &[Value::Int(33)]), 33);
    assert_eq!(
        call(&b, "demo/Flow.alloc(I)I", &[Value::Int(-1)]).unwrap_err(),
        Fault::NegativeArraySize(-1)
    );
}

#[test]
fn test_integer_division() {
    let b = build(CONTROL);
    let div = |a, b2| call(&b, "demo/Flow.div(II)I", &[Value::Int(a), Value::Int(b2)]);
    let rem = |a, b2| call(&b, "demo/Flow.rem(II)I", &[Value::Int(a), Value::Int(b2)]);
    assert_eq!(div(-7, 2).unwrap(), Some(Value::Int(-3)));
    assert_eq!(rem(-7, 2).unwrap(), Some(Value::Int(-1)));
    assert_eq!(rem(7, -2).unwrap(), Some(Value::Int(1)));
    assert_eq!(div(i32::MIN, -1).unwrap(), Some(Value::Int(i32::MIN)));
    assert_eq!(rem(i32::MIN, -1).unwrap(), Some(Value::Int(0)));
    assert_eq!(div(1, 0).unwrap_err(), Fault::DivideByZero);
    assert_eq!(rem(1, 0).unwrap_err(), Fault::DivideByZero);
}

#[test]
fn test_narrowing_conversions() {
    let b = build(CONTROL);
    for x in [0, 200, -1, 40000, i32::MIN, 0x1234_5678] {
        let expected = ((x as i8 as i32) + (x as u16 as i32)) ^ (x as i16 as i32);
        assert_eq!(int(&b, "demo/Flow.narrow(I)I", &[Value::Int(x)]), expected, "x = {}", x);
    }
}

const FLOATS: &str = r#"
[[class]]
name = "demo/Fp"
initialized = true

[[class.method]]
name = "hyp"
descriptor = "(DD)D"
static = true
max_locals = 4
code = [
    { dload = 0 },
    { dload = 0 },
    "dmul",
    { dload = 2 },
    { dload = 2 },
    "dmul",
    "dadd",
    { dload = 0 },
    "dsub",
    { dload = 2 },
    "ddiv",
    "dreturn",
]

[[class.method]]
name = "rem"
descriptor = "(DD)D"
static = true
max_locals = 4
code = [{ dload = 0 }, { dload = 2 }, "drem", "dreturn"]

[[class.method]]
name = "cmpl"
descriptor = "(DD)I"
static = true
max_locals = 4
code = [{ dload = 0 }, { dload = 2 }, "dcmpl", "ireturn"]

[[class.method]]
name = "cmpg"
descriptor = "(DD)I"
static = true
max_locals = 4
code = [{ dload = 0 }, { dload = 2 }, "dcmpg", "ireturn"]

[[class.method]]
name = "trunc"
descriptor = "(F)I"
static = true
max_locals = 1
code = [{ fload = 0 }, "f2d", "d2i", "ireturn"]

[[class.method]]
name = "widen"
descriptor = "(JI)F"
static = true
max_locals = 3
code = [{ lload = 0 }, "l2f", { iload = 2 }, "i2f", "fsub", "fneg", "freturn"]
"#;

#[test]
fn test_double_arithmetic() {
    let b = build(FLOATS);
    let (x, y) = (3.0f64, 4.0f64);
    let result = call(&b, "demo/Fp.hyp(DD)D", &[Value::Double(x), Value::Double(y)]).unwrap();
    assert_eq!(result, Some(Value::Double((x * x + y * y - x) / y)));
    let result = call(&b, "demo/Fp.rem(DD)D", &[Value::Double(-5.5), Value::Double(2.0)]).unwrap();
    assert_eq!(result, Some(Value::Double(-1.5)));
}

#[test]
fn test_double_compare_with_nan() {
    let b = build(FLOATS);
    let cases = [
        (1.0, 2.0, -1, -1),
        (2.0, 1.0, 1, 1),
        (0.0, -0.0, 0, 0),
        (f64::NAN, 1.0, -1, 1),
        (1.0, f64::NAN, -1, 1),
    ];
    for (a, c, l, g) in cases {
        let args = [Value::Double(a), Value::Double(c)];
        assert_eq!(int(&b, "demo/Fp.cmpl(DD)I", &args), l, "{} cmpl {}", a, c);
        assert_eq!(int(&b, "demo/Fp.cmpg(DD)I", &args), g, "{} cmpg {}", a, c);
    }
}

#[test]
fn test_float_conversions() {
    let b = build(FLOATS);
    assert_eq!(int(&b, "demo/Fp.trunc(F)I", &[Value::Float(3.9)]), 3);
    assert_eq!(int(&b, "demo/Fp.trunc(F)I", &[Value::Float(-3.9)]), -3);
    let result = call(&b, "demo/Fp.widen(JI)F", &[Value::Long(10), Value::Int(4)]).unwrap();
    assert_eq!(result, Some(Value::Float(-6.0)));
}

#[test]
fn test_constant_truncation_agrees_with_runtime() {
    let cases = [
        ("nan", f64::NAN),
        ("inf", f64::INFINITY),
        ("-inf", f64::NEG_INFINITY),
        ("1e10", 1e10),
        ("-1e20", -1e20),
        ("-7.5", -7.5),
    ];
    for (literal, v) in cases {
        let src = format!(
            r#"
[[class]]
name = "demo/Cv"
initialized = true

[[class.method]]
name = "folded"
descriptor = "()I"
static = true
code = [{{ dconst = {lit} }}, "d2i", "ireturn"]

[[class.method]]
name = "folded_long"
descriptor = "()J"
static = true
code = [{{ dconst = {lit} }}, "d2l", "lreturn"]

[[class.method]]
name = "folded_float"
descriptor = "()I"
static = true
code = [{{ fconst = {lit} }}, "f2i", "ireturn"]

[[class.method]]
name = "live"
descriptor = "(D)I"
static = true
max_locals = 2
code = [{{ dload = 0 }}, "d2i", "ireturn"]

[[class.method]]
name = "live_long"
descriptor = "(D)J"
static = true
max_locals = 2
code = [{{ dload = 0 }}, "d2l", "lreturn"]

[[class.method]]
name = "live_float"
descriptor = "(F)I"
static = true
max_locals = 1
code = [{{ fload = 0 }}, "f2i", "ireturn"]
"#,
            lit = literal
        );
        let b = build(&src);
        let arg = [Value::Double(v)];
        assert_eq!(
            call(&b, "demo/Cv.folded()I", &[]).unwrap(),
            call(&b, "demo/Cv.live(D)I", &arg).unwrap(),
            "d2i {}",
            literal
        );
        assert_eq!(
            call(&b, "demo/Cv.folded_long()J", &[]).unwrap(),
            call(&b, "demo/Cv.live_long(D)J", &arg).unwrap(),
            "d2l {}",
            literal
        );
        assert_eq!(
            call(&b, "demo/Cv.folded_float()I", &[]).unwrap(),
            call(&b, "demo/Cv.live_float(F)I", &[Value::Float(v as f32)]).unwrap(),
            "f2i {}",
            literal
        );
    }
    let b = build(FLOATS);
    assert_eq!(int(&b, "demo/Fp.trunc(F)I", &[Value::Float(f32::NAN)]), i32::MIN);
}

const CALLS: &str = r#"
[[class]]
name = "demo/Math"
initialized = true

[[class.method]]
name = "twice"
descriptor = "(I)I"
static = true
max_locals = 1
code = [{ iload = 0 }, { iload = 0 }, "iadd", "ireturn"]

[[class.method]]
name = "mix"
descriptor = "(JI)J"
static = true
max_locals = 3
code = [{ lload = 0 }, { iload = 2 }, "i2l", "lsub", "lreturn"]

[[class.method]]
name = "loop"
descriptor = "(I)I"
static = true
max_locals = 2
code = [
    { iconst = 0 },
    { istore = 1 },
    { iload = 1 },
    { iload = 0 },
    { invokestatic = "demo/Math.twice(I)I" },
    "iadd",
    { istore = 1 },
    { iinc = { index = 0, delta = -1 } },
    { iload = 0 },
    { ifgt = 2 },
    { lconst = 100 },
    { iload = 1 },
    { invokestatic = "demo/Math.mix(JI)J" },
    "l2i",
    "ireturn",
]
"#;

fn with_compiler(table: &str, src: &str) -> Build {
    build(&format!("[compiler]\n{}\n{}", table, src))
}

#[test]
fn test_inlining_preserves_results() {
    let plain = build(CALLS);
    let inlined = with_compiler("inline = true", CALLS);
    let listing = inlined.method("demo/Math.loop(I)I").unwrap().listing.to_string();
    assert!(!listing.contains("call"), "{}", listing);
    for n in [1, 2, 10] {
        let expected = 100 - n * (n + 1);
        assert_eq!(int(&plain, "demo/Math.loop(I)I", &[Value::Int(n)]), expected);
        assert_eq!(int(&inlined, "demo/Math.loop(I)I", &[Value::Int(n)]), expected);
    }
}

#[test]
fn test_yieldpoints_call_helper_when_flag_set() {
    let b = with_compiler("yieldpoints = true", CALLS);
    let mut rt = runtime(&b);
    let method = "demo/Math.loop(I)I";
    assert_eq!(rt.invoke(method, &[Value::Int(4)]).unwrap(), Some(Value::Int(80)));
    assert_eq!(rt.yields(), 0);
    rt.set_yield_flag(true).unwrap();
    assert_eq!(rt.invoke(method, &[Value::Int(4)]).unwrap(), Some(Value::Int(80)));
    assert_eq!(rt.yields(), 4);
}

#[test]
fn test_step_limit() {
    let b = with_compiler("max_steps = 50", CALLS);
    let err = call(&b, "demo/Math.loop(I)I", &[Value::Int(1000)]).unwrap_err();
    assert_eq!(err, Fault::StepLimit(50));
}
