//! Node.js-style `Buffer` constructor owned by the host context.
//!
//! The class is evaluated once per [`Host`](crate::host::Host) and the same
//! constructor is handed to every scope by reference. Byte codecs (utf8,
//! base64) run in Rust; the script receives them as a `codec` object so nothing
//! besides `Buffer` itself becomes globally visible.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use rquickjs::function::Func;
use rquickjs::{Ctx, Exception, Function, Object};

/// Build the `Buffer` constructor inside `ctx`.
pub fn create_buffer_constructor<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Function<'js>> {
    let codec = Object::new(ctx.clone())?;
    codec.set(
        "utf8Encode",
        Func::from(|text: String| -> Vec<u8> { text.into_bytes() }),
    )?;
    codec.set(
        "utf8Decode",
        Func::from(|bytes: Vec<u8>| -> String { String::from_utf8_lossy(&bytes).into_owned() }),
    )?;
    codec.set(
        "base64Encode",
        Func::from(|bytes: Vec<u8>| -> String { STANDARD.encode(bytes) }),
    )?;
    codec.set(
        "base64Decode",
        Func::from(
            |ctx: Ctx<'_>, text: String| -> rquickjs::Result<Vec<u8>> {
                let trimmed: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                STANDARD
                    .decode(trimmed.as_bytes())
                    .or_else(|_| STANDARD_NO_PAD.decode(trimmed.trim_end_matches('=').as_bytes()))
                    .map_err(|err| Exception::throw_type(&ctx, &format!("Invalid base64: {err}")))
            },
        ),
    )?;

    let factory: Function<'js> = ctx.eval(BUFFER_JS)?;
    factory.call((codec,))
}

const BUFFER_JS: &str = r#"
(function (codec) {
  'use strict';

  function hexEncode(bytes) {
    let out = '';
    for (let i = 0; i < bytes.length; i++) {
      out += bytes[i].toString(16).padStart(2, '0');
    }
    return out;
  }

  function hexDecode(str) {
    const len = str.length >>> 1;
    const bytes = new Uint8Array(len);
    for (let i = 0; i < len; i++) {
      bytes[i] = parseInt(str.slice(i * 2, i * 2 + 2), 16);
    }
    return bytes;
  }

  function latin1Encode(str) {
    const bytes = new Uint8Array(str.length);
    for (let i = 0; i < str.length; i++) {
      bytes[i] = str.charCodeAt(i) & 0xFF;
    }
    return bytes;
  }

  function latin1Decode(bytes) {
    let out = '';
    for (let i = 0; i < bytes.length; i++) {
      out += String.fromCharCode(bytes[i]);
    }
    return out;
  }

  function normalizeEncoding(enc) {
    const lower = (enc || 'utf8').toLowerCase();
    if (lower === 'hex' || lower === 'base64') return lower;
    if (lower === 'ascii' || lower === 'binary' || lower === 'latin1') return 'latin1';
    return 'utf8';
  }

  function encodeString(str, encoding) {
    switch (normalizeEncoding(encoding)) {
      case 'hex': return hexDecode(str);
      case 'base64': return Uint8Array.from(codec.base64Decode(str));
      case 'latin1': return latin1Encode(str);
      default: return Uint8Array.from(codec.utf8Encode(str));
    }
  }

  function decodeBytes(bytes, encoding, start, end) {
    const view = bytes.subarray(start || 0, end != null ? end : bytes.length);
    switch (normalizeEncoding(encoding)) {
      case 'hex': return hexEncode(view);
      case 'base64': return codec.base64Encode(Array.from(view));
      case 'latin1': return latin1Decode(view);
      default: return codec.utf8Decode(Array.from(view));
    }
  }

  class Buffer extends Uint8Array {
    static from(input, encodingOrOffset, length) {
      if (typeof input === 'string') {
        const bytes = encodeString(input, encodingOrOffset);
        const buf = new Buffer(bytes.length);
        buf.set(bytes);
        return buf;
      }
      if (input instanceof ArrayBuffer) {
        const offset = encodingOrOffset || 0;
        const len = length != null ? length : input.byteLength - offset;
        return new Buffer(input, offset, len);
      }
      if (ArrayBuffer.isView(input) || Array.isArray(input)) {
        const buf = new Buffer(input.length);
        buf.set(input);
        return buf;
      }
      if (input && typeof input === 'object' && input.type === 'Buffer' && Array.isArray(input.data)) {
        return Buffer.from(input.data);
      }
      throw new TypeError('The first argument must be a string, Buffer, ArrayBuffer, Array, or array-like object.');
    }

    static alloc(size, fill, encoding) {
      const buf = new Buffer(size);
      if (fill !== undefined && fill !== 0) {
        buf.fill(fill, 0, size, encoding);
      }
      return buf;
    }

    static allocUnsafe(size) {
      return new Buffer(size);
    }

    static isBuffer(obj) {
      return obj instanceof Buffer;
    }

    static isEncoding(encoding) {
      return ['utf8', 'utf-8', 'hex', 'base64', 'ascii', 'binary', 'latin1']
        .includes(String(encoding || '').toLowerCase());
    }

    static byteLength(value, encoding) {
      if (typeof value !== 'string') {
        if (ArrayBuffer.isView(value) || value instanceof ArrayBuffer) return value.byteLength;
        throw new TypeError('The "string" argument must be a string, Buffer, or ArrayBuffer');
      }
      return encodeString(value, encoding).length;
    }

    static concat(list, totalLength) {
      if (!Array.isArray(list)) throw new TypeError('"list" argument must be an Array of Buffers');
      const total = totalLength != null
        ? totalLength
        : list.reduce((acc, b) => acc + b.length, 0);
      const result = Buffer.alloc(total);
      let offset = 0;
      for (const buf of list) {
        if (offset >= total) break;
        const src = buf instanceof Uint8Array ? buf : Buffer.from(buf);
        const copyLen = Math.min(src.length, total - offset);
        result.set(src.subarray(0, copyLen), offset);
        offset += copyLen;
      }
      return result;
    }

    static compare(a, b) {
      if (!(a instanceof Uint8Array) || !(b instanceof Uint8Array)) {
        throw new TypeError('Arguments must be Buffers');
      }
      const len = Math.min(a.length, b.length);
      for (let i = 0; i < len; i++) {
        if (a[i] !== b[i]) return a[i] < b[i] ? -1 : 1;
      }
      return a.length === b.length ? 0 : (a.length < b.length ? -1 : 1);
    }

    toString(encoding, start, end) {
      return decodeBytes(this, encoding, start, end);
    }

    write(string, offset, encoding) {
      if (typeof offset === 'string') { encoding = offset; offset = 0; }
      offset = offset || 0;
      const bytes = encodeString(string, encoding);
      const writeLen = Math.min(bytes.length, this.length - offset);
      this.set(bytes.subarray(0, writeLen), offset);
      return writeLen;
    }

    toJSON() {
      return { type: 'Buffer', data: Array.from(this) };
    }

    equals(other) {
      if (!(other instanceof Uint8Array)) throw new TypeError('Argument must be a Buffer');
      return Buffer.compare(this, other) === 0;
    }

    copy(target, targetStart, sourceStart, sourceEnd) {
      targetStart = targetStart || 0;
      sourceStart = sourceStart || 0;
      sourceEnd = sourceEnd != null ? sourceEnd : this.length;
      const len = Math.min(sourceEnd - sourceStart, target.length - targetStart);
      target.set(this.subarray(sourceStart, sourceStart + len), targetStart);
      return len;
    }

    indexOf(value, byteOffset, encoding) {
      const needle = typeof value === 'number'
        ? [value & 0xFF]
        : (typeof value === 'string' ? encodeString(value, encoding) : value);
      const from = byteOffset || 0;
      if (needle.length === 0) return from <= this.length ? from : -1;
      outer: for (let i = from; i <= this.length - needle.length; i++) {
        for (let j = 0; j < needle.length; j++) {
          if (this[i + j] !== needle[j]) continue outer;
        }
        return i;
      }
      return -1;
    }

    includes(value, byteOffset, encoding) {
      return this.indexOf(value, byteOffset, encoding) !== -1;
    }

    fill(value, offset, end, encoding) {
      offset = offset || 0;
      end = end != null ? end : this.length;
      const bytes = typeof value === 'string' ? encodeString(value, encoding) : [value & 0xFF];
      if (bytes.length === 0) return this;
      for (let i = offset; i < end; i++) {
        this[i] = bytes[(i - offset) % bytes.length];
      }
      return this;
    }

    slice(start, end) {
      return this.subarray(start, end);
    }
  }

  return Buffer;
})
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn eval_with_buffer<T>(source: &str) -> T
    where
        T: for<'js> rquickjs::FromJs<'js>,
    {
        let runtime = Runtime::new().expect("runtime");
        let context = Context::full(&runtime).expect("context");
        context.with(|ctx| {
            let buffer = create_buffer_constructor(&ctx).expect("buffer");
            ctx.globals().set("Buffer", buffer).expect("install");
            ctx.eval::<T, _>(source).expect("eval")
        })
    }

    #[test]
    fn utf8_round_trip() {
        let text: String = eval_with_buffer("Buffer.from('héllo ✓').toString()");
        assert_eq!(text, "héllo ✓");
    }

    #[test]
    fn base64_and_hex_encodings() {
        let encoded: String = eval_with_buffer("Buffer.from('hello').toString('base64')");
        assert_eq!(encoded, "aGVsbG8=");
        let decoded: String = eval_with_buffer("Buffer.from('aGVsbG8=', 'base64').toString()");
        assert_eq!(decoded, "hello");
        let hex: String = eval_with_buffer("Buffer.from([1, 171, 255]).toString('hex')");
        assert_eq!(hex, "01abff");
    }

    #[test]
    fn static_helpers() {
        let ok: bool = eval_with_buffer(
            "Buffer.isBuffer(Buffer.alloc(2)) && !Buffer.isBuffer(new Uint8Array(2)) \
             && Buffer.byteLength('✓') === 3 \
             && Buffer.concat([Buffer.from('ab'), Buffer.from('cd')]).toString() === 'abcd'",
        );
        assert!(ok);
    }

    #[test]
    fn invalid_base64_throws_type_error() {
        let name: String = eval_with_buffer(
            "try { Buffer.from('*&^', 'base64'); 'none' } catch (e) { e.name }",
        );
        assert_eq!(name, "TypeError");
    }
}
