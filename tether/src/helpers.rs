use std::fmt::Debug;

use ssh_encoding::{Decode, Encode, Writer};

#[doc(hidden)]
pub trait EncodedExt {
    fn encoded(&self) -> Result<Vec<u8>, ssh_encoding::Error>;
}

impl<E: Encode> EncodedExt for E {
    fn encoded(&self) -> Result<Vec<u8>, ssh_encoding::Error> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

pub struct NameList(pub Vec<String>);

impl Debug for NameList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl NameList {
    pub fn as_encoded_string(&self) -> String {
        self.0.join(",")
    }

    pub fn from_encoded_string(value: &str) -> Self {
        Self(value.split(',').map(|x| x.to_string()).collect())
    }
}

impl Encode for NameList {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.as_encoded_string().encoded_len()
    }

    fn encode(&self, writer: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
        self.as_encoded_string().encode(writer)
    }
}

impl Decode for NameList {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl ssh_encoding::Reader) -> Result<Self, Self::Error> {
        let s = String::decode(reader)?;
        Ok(Self::from_encoded_string(&s))
    }
}

/// Encode a byte string as an SSH `mpint` (RFC 4251 §5): leading zero bytes
/// are stripped, and a zero byte is prepended when the most significant bit
/// would otherwise read as a sign bit.
pub(crate) fn encode_mpint(s: &[u8], w: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
    let mut i = 0;
    while i < s.len() && s.get(i) == Some(&0) {
        i += 1;
    }
    let s = s.get(i..).unwrap_or(&[]);
    let sign_pad = s.first().is_some_and(|b| b & 0x80 != 0);
    let len = s.len() + usize::from(sign_pad);
    (len as u32).encode(w)?;
    if sign_pad {
        w.write(&[0])?;
    }
    w.write(s)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mpint_strips_and_pads() -> Result<(), ssh_encoding::Error> {
        let mut out = Vec::new();
        encode_mpint(&[0, 0, 0x7f, 0x01], &mut out)?;
        assert_eq!(out, vec![0, 0, 0, 2, 0x7f, 0x01]);

        out.clear();
        encode_mpint(&[0x80, 0x01], &mut out)?;
        assert_eq!(out, vec![0, 0, 0, 3, 0, 0x80, 0x01]);

        out.clear();
        encode_mpint(&[0, 0], &mut out)?;
        assert_eq!(out, vec![0, 0, 0, 0]);
        Ok(())
    }
}
