use bytes::{Buf, Bytes, BytesMut};

use crate::error::Result;

pub trait MarshalSize {
    fn marshal_size(&self) -> usize;
}

pub trait Marshal: MarshalSize {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize>;

    fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.marshal_size());
        buf.resize(self.marshal_size(), 0);
        let n = self.marshal_to(&mut buf)?;
        buf.truncate(n);
        Ok(buf.freeze())
    }
}

pub trait Unmarshal: MarshalSize {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf;
}
