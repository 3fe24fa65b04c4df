//! Instruction stream encoding: decoding a superinstruction yields exactly
//! the primitives it was fused from, and fusing them again reproduces the
//! same words.

mod common;

use common::*;
use tiervm::backend::bytecode::opcodes::ALL_OPCODES;
use tiervm::backend::bytecode::{
    decode_superinstruction, disassemble, encode, CodeError, Opcode, Primitive, Word,
};

fn decode_all(words: &[Word]) -> Vec<Primitive> {
    let mut out = Vec::new();
    let mut index = 0;
    while index < words.len() {
        let (prims, next) = decode_superinstruction(words, index).unwrap();
        assert!(next > index);
        out.extend(prims);
        index = next;
    }
    out
}

#[test]
fn test_every_superinstruction_round_trips() {
    for op in ALL_OPCODES.iter().copied().filter(|op| op.is_superinstruction()) {
        let prims: Vec<Primitive> = op
            .primitives()
            .iter()
            .enumerate()
            .map(|(i, p)| (*p, p.has_arg().then_some(i as u32 + 1)))
            .collect();
        let words = encode(&prims).unwrap();
        assert_eq!(words[0], Word::opcode(op), "{} was not fused", op);
        assert_eq!(words.len(), 1 + op.arg_count());

        let (decoded, next) = decode_superinstruction(&words, 0).unwrap();
        assert_eq!(decoded, prims, "{}", op);
        assert_eq!(next, words.len());
        assert_eq!(encode(&decoded).unwrap(), words);
    }
}

#[test]
fn test_program_streams_round_trip() {
    for code in [
        loop_sum(),
        loop_sum_fused(),
        for_break_continue(),
        continue_through_finally(),
        safe_div(),
        nested_handlers(),
        with_body(),
        countdown(),
    ] {
        let prims = decode_all(code.words());
        let total: usize = code.instrs().iter().map(|i| i.prims.len()).sum();
        assert_eq!(prims.len(), total, "{}", code.name());
        assert_eq!(decode_all(&encode(&prims).unwrap()), prims, "{}", code.name());
    }
}

#[test]
fn test_builder_fuses_and_disassembles() {
    let code = loop_sum_fused();
    assert!(code
        .instrs()
        .iter()
        .any(|i| i.op.is_superinstruction()));
    let listing = disassemble(&code);
    assert!(listing.contains("SETUP_LOOP"), "{}", listing);
    assert!(listing.contains("JUMP_ABSOLUTE"), "{}", listing);
    assert!(listing.contains(">>"), "{}", listing);
}

#[test]
fn test_truncated_superinstruction_is_rejected() {
    let words = [
        Word::opcode(Opcode::LoadFastLoadFastBinaryAdd),
        Word::argument(0).unwrap(),
    ];
    assert_eq!(
        decode_superinstruction(&words, 0),
        Err(CodeError::MissingArgument {
            index: 2,
            opcode: Opcode::LoadFast,
        })
    );
}
