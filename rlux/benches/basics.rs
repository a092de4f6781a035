//! These benchmarks are taken from the testsuite and modified for criterion

use std::io;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rlux::VM;

pub fn binary_trees(c: &mut Criterion) {
    let src = r#"
class Tree {
  init(item, depth) {
    this.item = item;
    this.depth = depth;
    if (depth > 0) {
      let item2 = item + item;
      depth = depth - 1;
      this.left = Tree(item2 - 1, depth);
      this.right = Tree(item2, depth);
    } else {
      this.left = nil;
      this.right = nil;
    }
  }

  check() {
    if (this.left == nil) {
      return this.item;
    }
    return this.item + this.left.check() - this.right.check();
  }
}

let minDepth = 4;
let maxDepth = 6;
let stretchDepth = maxDepth + 1;

Tree(0, stretchDepth).check();

let longLivedTree = Tree(0, maxDepth);

// iterations = 2 ** maxDepth
let iterations = 1;
let d = 0;
while (d < maxDepth) {
  iterations = iterations * 2;
  d = d + 1;
}

let depth = minDepth;
while (depth < stretchDepth) {
  let check = 0;
  for (let i = 1; i <= iterations; i += 1) {
    check = check + Tree(i, depth).check() + Tree(-i, depth).check();
  }
  iterations = iterations / 4;
  depth = depth + 2;
}

longLivedTree.check();
"#;
    c.bench_function("binary_trees", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src), &mut io::sink()));
    });
}

pub fn fib(c: &mut Criterion) {
    let src = r#"
fun fib(n) { if (n < 2) return n; return fib(n - 2) + fib(n - 1); }
fib(20);
"#;
    c.bench_function("fib_20", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src), &mut io::sink()));
    });
}

pub fn equality(c: &mut Criterion) {
    let src = r#"
let i = 0;
while (i < 10000) {
  i = i + 1;

  1; 1; 1; 2; 1; nil; 1; "str"; 1; true;
  nil; nil; nil; 1; nil; "str"; nil; true;
  true; true; true; 1; true; false; true; "str"; true; nil;
  "str"; "str"; "str"; "stru"; "str"; 1; "str"; nil; "str"; true;
}
"#;
    c.bench_function("equality", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src), &mut io::sink()));
    });
}

pub fn containers(c: &mut Criterion) {
    let src = r#"
let totals = { "sum": 0 };
let values = [];
let push = module("array")["push"];
for (let i = 0; i < 1000; i += 1) {
  push(values, i);
  totals["sum"] = totals["sum"] + values[i];
}
totals["sum"];
"#;
    c.bench_function("containers", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src), &mut io::sink()));
    });
}

criterion_group!(benches, binary_trees, fib, equality, containers);
criterion_main!(benches);
